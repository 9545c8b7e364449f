//! Subscription and bind-lifecycle behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use atom_flow::{Atom, Scope};
use parking_lot::Mutex;

#[test]
fn callback_receives_new_value() {
    let scope = Scope::new();
    let leaf = Atom::value(String::from("a"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _binding = scope.bind(&leaf, {
        let seen = seen.clone();
        move |v: &String| seen.lock().push(v.clone())
    });

    scope.set(&leaf, "b".into()).unwrap();
    scope.set(&leaf, "c".into()).unwrap();
    assert_eq!(*seen.lock(), vec!["b".to_string(), "c".to_string()]);
}

#[test]
fn unbound_callback_stops_firing() {
    let scope = Scope::new();
    let leaf = Atom::value(0_i64);
    let fired = Arc::new(AtomicUsize::new(0));
    let binding = scope.bind(&leaf, {
        let fired = fired.clone();
        move |_| {
            fired.fetch_add(1, Ordering::Relaxed);
        }
    });

    scope.set(&leaf, 1).unwrap();
    scope.unbind(&binding);
    scope.set(&leaf, 2).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn hook_runs_on_first_bind_only() {
    let hooked = Arc::new(AtomicUsize::new(0));
    let leaf = Atom::value(0_i64).on_bind({
        let hooked = hooked.clone();
        move |_scope| {
            hooked.fetch_add(1, Ordering::Relaxed);
            None
        }
    });
    let scope = Scope::new();

    let b1 = scope.bind(&leaf, |_| {});
    let b2 = scope.bind(&leaf, |_| {});
    assert_eq!(hooked.load(Ordering::Relaxed), 1);

    scope.unbind(&b1);
    scope.unbind(&b2);
    assert_eq!(hooked.load(Ordering::Relaxed), 1);
}

#[test]
fn teardown_fires_once_when_last_subscriber_leaves() {
    let torn = Arc::new(AtomicUsize::new(0));
    let leaf = Atom::value(0_i64).on_bind({
        let torn = torn.clone();
        move |_scope| {
            let torn = torn.clone();
            Some(Box::new(move || {
                torn.fetch_add(1, Ordering::Relaxed);
            }))
        }
    });
    let scope = Scope::new();

    let b1 = scope.bind(&leaf, |_| {});
    let b2 = scope.bind(&leaf, |_| {});

    scope.unbind(&b1);
    assert_eq!(torn.load(Ordering::Relaxed), 0, "a subscriber remains");
    scope.unbind(&b2);
    assert_eq!(torn.load(Ordering::Relaxed), 1);
    // a stray second unbind must not re-fire the teardown
    scope.unbind(&b2);
    assert_eq!(torn.load(Ordering::Relaxed), 1);
}

#[test]
fn rebinding_runs_the_hook_again() {
    let hooked = Arc::new(AtomicUsize::new(0));
    let torn = Arc::new(AtomicUsize::new(0));
    let leaf = Atom::value(0_i64).on_bind({
        let hooked = hooked.clone();
        let torn = torn.clone();
        move |_scope| {
            hooked.fetch_add(1, Ordering::Relaxed);
            let torn = torn.clone();
            Some(Box::new(move || {
                torn.fetch_add(1, Ordering::Relaxed);
            }))
        }
    });
    let scope = Scope::new();

    let b1 = scope.bind(&leaf, |_| {});
    scope.unbind(&b1);
    let b2 = scope.bind(&leaf, |_| {});
    scope.unbind(&b2);

    assert_eq!(hooked.load(Ordering::Relaxed), 2);
    assert_eq!(torn.load(Ordering::Relaxed), 2);
}

#[test]
fn unbind_atom_clears_all_subscribers() {
    let torn = Arc::new(AtomicUsize::new(0));
    let leaf = Atom::value(0_i64).on_bind({
        let torn = torn.clone();
        move |_scope| {
            let torn = torn.clone();
            Some(Box::new(move || {
                torn.fetch_add(1, Ordering::Relaxed);
            }))
        }
    });
    let scope = Scope::new();

    let _b1 = scope.bind(&leaf, |_| {});
    let _b2 = scope.bind(&leaf, |_| {});
    assert_eq!(scope.subscriber_count(&leaf), 2);

    scope.unbind_atom(&leaf);
    assert_eq!(scope.subscriber_count(&leaf), 0);
    assert_eq!(torn.load(Ordering::Relaxed), 1);

    // unbinding an atom with no subscribers is a no-op
    scope.unbind_atom(&leaf);
    assert_eq!(torn.load(Ordering::Relaxed), 1);
}

#[test]
fn unbind_all_clears_every_atom() {
    let scope = Scope::new();
    let a = Atom::value(0_i64);
    let b = Atom::value(0_i64);
    let fired = Arc::new(AtomicUsize::new(0));
    for atom in [&a, &b] {
        scope.bind(atom, {
            let fired = fired.clone();
            move |_| {
                fired.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    scope.unbind_all();
    scope.set(&a, 1).unwrap();
    scope.set(&b, 1).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 0);
}

#[test]
fn binding_before_first_read_still_notifies() {
    let scope = Scope::new();
    let leaf = Atom::value(0_i64);
    let derived = Atom::computed({
        let leaf = leaf.clone();
        move |get| Ok(get.get(&leaf)? * 2)
    });

    // never read through the scope before binding
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _binding = scope.bind(&derived, {
        let seen = seen.clone();
        move |v: &i64| seen.lock().push(*v)
    });

    scope.set(&leaf, 4).unwrap();
    assert_eq!(*seen.lock(), vec![8]);
}

#[test]
fn hooks_run_per_scope() {
    let hooked = Arc::new(AtomicUsize::new(0));
    let leaf = Atom::value(0_i64).on_bind({
        let hooked = hooked.clone();
        move |_scope| {
            hooked.fetch_add(1, Ordering::Relaxed);
            None
        }
    });
    let s1 = Scope::new();
    let s2 = Scope::new();
    s1.bind(&leaf, |_| {});
    s2.bind(&leaf, |_| {});
    assert_eq!(hooked.load(Ordering::Relaxed), 2);
}

#[test]
fn notifications_fire_once_per_batch_per_atom() {
    let scope = Scope::new();
    let a = Atom::value(0_i64);
    let b = Atom::value(0_i64);
    let sum = Atom::computed({
        let (a, b) = (a.clone(), b.clone());
        move |get| Ok(get.get(&a)? + get.get(&b)?)
    });
    let touch_twice = Atom::action({
        let a = a.clone();
        move |ctx, _: ()| {
            let current = ctx.get(&a)?;
            ctx.set(&a, current + 1)?;
            ctx.set(&a, current + 2)?;
            Ok(())
        }
    });

    let fired = Arc::new(AtomicUsize::new(0));
    let _binding = scope.bind(&sum, {
        let fired = fired.clone();
        move |_| {
            fired.fetch_add(1, Ordering::Relaxed);
        }
    });

    scope.set(&touch_twice, ()).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert_eq!(scope.get(&sum).unwrap(), 2);
}
