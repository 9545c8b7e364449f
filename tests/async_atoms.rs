//! Asynchronous read functions: suspension, settlement, and supersession.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use atom_flow::{Atom, AtomError, Scope};
use futures::channel::oneshot;
use parking_lot::Mutex;

#[tokio::test]
async fn computation_without_suspension_settles_synchronously() {
    let atom = Atom::computed_async(|_ctx| async { Ok::<_, AtomError>(7_i64) });
    let scope = Scope::new();
    // the synchronous prefix is the whole computation: no awaiting needed
    assert_eq!(scope.get(&atom).unwrap(), 7);
}

#[tokio::test]
async fn async_value_resolves_and_notifies() {
    let scope = Scope::new();
    let leaf = Atom::value(3_i64);
    let (tx, rx) = oneshot::channel::<i64>();
    let rx = Arc::new(Mutex::new(Some(rx)));
    let slow = Atom::computed_async({
        let leaf = leaf.clone();
        let rx = rx.clone();
        move |ctx| {
            let leaf = leaf.clone();
            let rx = rx.lock().take().expect("single execution");
            async move {
                let base = ctx.get(&leaf).await?;
                let extra = rx.await.map_err(AtomError::user)?;
                Ok(base + extra)
            }
        }
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _binding = scope.bind(&slow, {
        let seen = seen.clone();
        move |v: &i64| seen.lock().push(*v)
    });

    // not settled yet: a plain get suspends, load hands out the future
    assert!(matches!(scope.get(&slow), Err(AtomError::Pending { .. })));
    let pending = scope.load(&slow).unwrap().pending().expect("in flight");

    tx.send(4).unwrap();
    assert_eq!(pending.await.unwrap(), 7);
    assert_eq!(scope.get(&slow).unwrap(), 7);
    assert_eq!(*seen.lock(), vec![7]);
}

#[tokio::test]
async fn superseded_computation_is_discarded() {
    let scope = Scope::new();
    let leaf = Atom::value(1_i64);
    let (tx1, rx1) = oneshot::channel::<i64>();
    let (tx2, rx2) = oneshot::channel::<i64>();
    let receivers = Arc::new(Mutex::new(VecDeque::from([rx1, rx2])));
    let slow = Atom::computed_async({
        let leaf = leaf.clone();
        let receivers = receivers.clone();
        move |ctx| {
            let leaf = leaf.clone();
            let rx = receivers.lock().pop_front().expect("one receiver per run");
            async move {
                let base = ctx.get(&leaf).await?;
                let extra = rx.await.map_err(AtomError::user)?;
                Ok(base + extra)
            }
        }
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _binding = scope.bind(&slow, {
        let seen = seen.clone();
        move |v: &i64| seen.lock().push(*v)
    });

    let first = scope.load(&slow).unwrap().pending().expect("in flight");
    // the dependency changes before the first computation settles
    scope.set(&leaf, 2).unwrap();
    let second = scope.load(&slow).unwrap().pending().expect("restarted");

    tx1.send(10).unwrap();
    tx2.send(20).unwrap();

    // the first token was superseded: its result is discarded, not observed
    assert!(matches!(first.await, Err(AtomError::Superseded)));
    assert_eq!(second.await.unwrap(), 22);
    assert_eq!(scope.get(&slow).unwrap(), 22);
    assert_eq!(*seen.lock(), vec![22]);
}

#[tokio::test]
async fn rejected_computation_is_retried() {
    let runs = Arc::new(AtomicUsize::new(0));
    let outcomes: Arc<Mutex<VecDeque<Result<i64, &'static str>>>> =
        Arc::new(Mutex::new(VecDeque::from([Err("not ready"), Ok(5)])));
    let atom = Atom::computed_async({
        let outcomes = outcomes.clone();
        let runs = runs.clone();
        move |_ctx| {
            runs.fetch_add(1, Ordering::Relaxed);
            let outcome = outcomes.lock().pop_front().expect("one outcome per run");
            async move {
                match outcome {
                    Ok(v) => Ok(v),
                    Err(msg) => Err(AtomError::user(anyhow::anyhow!(msg))),
                }
            }
        }
    });
    let scope = Scope::new();

    let err = scope.get_async(&atom).await.unwrap_err();
    assert!(err.user_error().is_some());
    // the failure was not cached: the next read re-executes
    assert_eq!(scope.get_async(&atom).await.unwrap(), 5);
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn get_async_waits_through_settlement() {
    let scope = Scope::new();
    let leaf = Atom::value(10_i64);
    let doubled = Atom::computed_async({
        let leaf = leaf.clone();
        move |ctx| {
            let leaf = leaf.clone();
            async move { Ok(ctx.get(&leaf).await? * 2) }
        }
    });

    assert_eq!(scope.get_async(&doubled).await.unwrap(), 20);
    scope.set(&leaf, 21).unwrap();
    assert_eq!(scope.get_async(&doubled).await.unwrap(), 42);
}

#[tokio::test]
async fn sync_derivation_over_async_dependency_suspends() {
    let scope = Scope::new();
    let (tx, rx) = oneshot::channel::<i64>();
    let rx = Arc::new(Mutex::new(Some(rx)));
    let slow = Atom::computed_async({
        let rx = rx.clone();
        move |_ctx| {
            let rx = rx.lock().take().expect("single execution");
            async move { rx.await.map_err(AtomError::user) }
        }
    });
    let plus_one = Atom::computed({
        let slow = slow.clone();
        move |get| Ok(get.get(&slow)? + 1)
    });

    // the derived read suspends on its in-flight dependency
    assert!(matches!(
        scope.get(&plus_one),
        Err(AtomError::Pending { .. })
    ));

    tx.send(41).unwrap();
    assert_eq!(scope.get_async(&slow).await.unwrap(), 41);
    assert_eq!(scope.get(&plus_one).unwrap(), 42);
}

#[tokio::test]
async fn settlement_invalidates_sync_dependents() {
    let scope = Scope::new();
    let leaf = Atom::value(1_i64);
    let relay = Atom::computed_async({
        let leaf = leaf.clone();
        move |ctx| {
            let leaf = leaf.clone();
            async move { ctx.get(&leaf).await }
        }
    });
    let display = Atom::computed({
        let relay = relay.clone();
        move |get| Ok(format!("value: {}", get.get(&relay)?))
    });

    assert_eq!(scope.get_async(&relay).await.unwrap(), 1);
    assert_eq!(scope.get(&display).unwrap(), "value: 1");

    scope.set(&leaf, 9).unwrap();
    assert_eq!(scope.get_async(&relay).await.unwrap(), 9);
    assert_eq!(scope.get(&display).unwrap(), "value: 9");
}
