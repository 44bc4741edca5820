// Ordering guarantees of the scope scheduler, observed through the scheduler
// itself and through a database sharing one connection.

use rust_sqlite_scope::{
    Database, Params, Schema, ScopeScheduler, ScopeState, SqliteConfig, SqliteError, Value,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn scopes_ended_immediately_start_in_creation_order() {
    let scheduler = ScopeScheduler::default();
    let mut started = Vec::new();
    let mut created = Vec::new();

    for _ in 0..20 {
        let scope = scheduler.new_scope().unwrap();
        created.push(scope.id());
        assert_eq!(scheduler.pending_len(), 1);

        scope.wait_started().await.unwrap();
        started.push(scope.id());
        scope.end();
        assert_eq!(scheduler.pending_len(), 0);
    }

    assert_eq!(started, created);
}

#[tokio::test]
async fn queued_scopes_are_admitted_fifo() {
    let scheduler = ScopeScheduler::default();
    let scopes: Vec<_> = (0..5).map(|_| scheduler.new_scope().unwrap()).collect();
    assert_eq!(scheduler.pending_len(), 5);

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    // Register waiters in reverse so admission order cannot come from wait order.
    for scope in scopes.iter().rev() {
        let scope = scope.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            scope.wait_started().await.unwrap();
            order.lock().await.push(scope.id());
        }));
    }

    for (index, scope) in scopes.iter().enumerate() {
        settle().await;
        assert_eq!(scope.state(), ScopeState::Started);
        for later in &scopes[index + 1..] {
            assert_eq!(later.state(), ScopeState::Pending);
        }
        assert_eq!(scheduler.pending_len(), scopes.len() - index);
        scope.end();
    }

    for waiter in waiters {
        waiter.await.unwrap();
    }
    let expected: Vec<_> = scopes.iter().map(|s| s.id()).collect();
    assert_eq!(*order.lock().await, expected);
    assert_eq!(scheduler.pending_len(), 0);
    assert_eq!(scheduler.current_community().state(), ScopeState::Started);
}

#[tokio::test]
async fn close_waits_for_outstanding_scopes() {
    let scheduler = ScopeScheduler::default();
    let first = scheduler.new_scope().unwrap();
    let second = scheduler.new_scope().unwrap();

    let closing = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.close().await })
    };
    settle().await;
    assert!(!closing.is_finished());
    assert!(matches!(
        scheduler.new_scope(),
        Err(SqliteError::SchedulerClosed)
    ));

    first.end();
    settle().await;
    assert!(!closing.is_finished());
    assert_eq!(second.state(), ScopeState::Started);

    second.end();
    closing.await.unwrap();
    assert_eq!(scheduler.pending_len(), 0);
    assert!(matches!(
        scheduler.new_scope(),
        Err(SqliteError::SchedulerClosed)
    ));
}

#[tokio::test]
async fn unscoped_work_issued_during_a_transaction_waits_for_it() {
    let scheduler = ScopeScheduler::default();
    let transaction = scheduler.new_scope().unwrap();

    let unscoped = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.wait_scope_start(None).await })
    };
    settle().await;
    assert!(!unscoped.is_finished());

    transaction.end();
    let community = unscoped.await.unwrap().unwrap();
    assert_eq!(community.state(), ScopeState::Started);
}

// The superseded community window is ended without waiting for the work it
// already admitted, so a transaction can start while that work is still
// running on the shared connection. This test pins that behavior down.
#[tokio::test]
async fn transaction_start_does_not_wait_for_work_already_admitted() {
    let scheduler = ScopeScheduler::default();

    let in_flight = scheduler.wait_scope_start(None).await.unwrap();
    assert_eq!(in_flight.state(), ScopeState::Started);

    let transaction = scheduler.new_scope().unwrap();
    assert_eq!(in_flight.state(), ScopeState::Ended);
    assert_eq!(transaction.state(), ScopeState::Started);
    transaction.wait_started().await.unwrap();

    transaction.end();
}

#[tokio::test]
async fn explicit_ended_scope_rejects_the_operation() {
    let scheduler = ScopeScheduler::default();
    let scope = scheduler.new_scope().unwrap();
    scope.end();
    assert!(matches!(
        scheduler.wait_scope_start(Some(&scope)).await,
        Err(SqliteError::ScopeEnded(id)) if id == scope.id()
    ));
}

#[tokio::test]
async fn concurrent_transactions_do_not_interleave() {
    let db = Database::open(SqliteConfig::memory(Schema::new())).unwrap();
    db.run(
        "CREATE TABLE ledger (id INTEGER PRIMARY KEY, who TEXT NOT NULL)",
        &Params::new(),
        None,
    )
    .await
    .unwrap();

    let mut tasks = Vec::new();
    for who in ["a", "b", "c"] {
        let scope = db.new_scope().unwrap();
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            db.begin(Some(&scope)).await?;
            for _ in 0..3 {
                db.run(
                    "INSERT INTO ledger (who) VALUES (@who)",
                    &Params::new().with_value("@who", who),
                    Some(&scope),
                )
                .await?;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            db.commit(Some(&scope)).await?;
            scope.end();
            Ok::<_, SqliteError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let rows = db
        .all("SELECT who FROM ledger ORDER BY id", &Params::new(), None)
        .await
        .unwrap();
    let who: Vec<_> = rows
        .iter()
        .map(|row| match row.get("who") {
            Some(Value::Text(who)) => who.clone(),
            other => panic!("unexpected value {:?}", other),
        })
        .collect();
    assert_eq!(who, ["a", "a", "a", "b", "b", "b", "c", "c", "c"]);

    db.close().await;
}
