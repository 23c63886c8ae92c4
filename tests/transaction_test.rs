mod common;

use common::User;
use relstore::{Repository, StoreError, fields, predicate, with_scope};

#[tokio::test]
async fn test_commit_persists_across_sessions() {
    let db = common::setup().await;
    let repo = Repository::<User>::new();

    let mut session = db.manager.open_session().await.expect("open session");
    let scope = session.begin().await.expect("begin");
    repo.create(&mut session, fields! {"name" => "ada", "active" => true})
        .await
        .expect("create");
    session.commit(scope).await.expect("commit");
    session.close().await;

    let mut session = db.manager.open_session().await.expect("open session");
    assert_eq!(repo.count(&mut session, None).await.expect("count"), 1);
    session.close().await;
}

#[tokio::test]
async fn test_rollback_discards_writes() {
    let db = common::setup().await;
    let repo = Repository::<User>::new();

    let mut session = db.manager.open_session().await.expect("open session");
    let scope = session.begin().await.expect("begin");
    repo.create(&mut session, fields! {"name" => "ada", "active" => true})
        .await
        .expect("create");
    session.rollback(scope).await.expect("rollback");

    assert_eq!(repo.count(&mut session, None).await.expect("count"), 0);
    session.close().await;
}

#[tokio::test]
async fn test_inner_rollback_preserves_outer_writes() {
    let db = common::setup().await;
    let repo = Repository::<User>::new();

    let mut session = db.manager.open_session().await.expect("open session");

    let outer = session.begin().await.expect("outer begin");
    repo.create(&mut session, fields! {"name" => "kept", "active" => true})
        .await
        .expect("outer create");

    let inner = session.begin().await.expect("inner begin");
    assert_eq!(inner.depth(), 1);
    repo.create(&mut session, fields! {"name" => "discarded", "active" => true})
        .await
        .expect("inner create");
    session.rollback(inner).await.expect("inner rollback");

    // The outer scope is still open and still holds its write.
    assert!(session.in_transaction());
    assert_eq!(session.depth(), 1);
    session.commit(outer).await.expect("outer commit");
    session.close().await;

    let mut session = db.manager.open_session().await.expect("open session");
    let kept = repo
        .get_by(&mut session, &predicate! {"name" => "kept"})
        .await
        .expect("get_by");
    assert!(kept.is_some());
    let discarded = repo
        .get_by(&mut session, &predicate! {"name" => "discarded"})
        .await
        .expect("get_by");
    assert!(discarded.is_none());
    session.close().await;
}

#[tokio::test]
async fn test_closing_outer_scope_before_inner_is_rejected() {
    let db = common::setup().await;

    let mut session = db.manager.open_session().await.expect("open session");
    let outer = session.begin().await.expect("outer begin");
    let _inner = session.begin().await.expect("inner begin");

    let err = session.commit(outer).await.unwrap_err();
    match err {
        StoreError::ScopeOrderViolation {
            requested,
            innermost,
        } => {
            assert_eq!(requested, 0);
            assert_eq!(innermost, 1);
        }
        other => panic!("expected ScopeOrderViolation, got {other:?}"),
    }

    // Both scopes are still open; close() unwinds them.
    assert_eq!(session.depth(), 2);
    session.close().await;
}

#[tokio::test]
async fn test_with_scope_commits_on_ok() {
    let db = common::setup().await;
    let repo = Repository::<User>::new();

    let mut session = db.manager.open_session().await.expect("open session");
    let user = with_scope(&mut session, |s| {
        Box::pin(async move {
            repo.create(s, fields! {"name" => "ada", "active" => true})
                .await
        })
    })
    .await
    .expect("with_scope");

    assert!(!session.in_transaction());
    assert!(repo.get(&mut session, user.id).await.expect("get").is_some());
    session.close().await;
}

#[tokio::test]
async fn test_with_scope_rolls_back_on_error_and_outer_survives() {
    let db = common::setup().await;
    let repo = Repository::<User>::new();

    let mut session = db.manager.open_session().await.expect("open session");
    let outer = session.begin().await.expect("outer begin");
    repo.create(&mut session, fields! {"name" => "kept", "active" => true})
        .await
        .expect("outer create");

    let result: Result<(), _> = with_scope(&mut session, |s| {
        Box::pin(async move {
            repo.create(s, fields! {"name" => "doomed", "active" => true})
                .await?;
            Err(StoreError::configuration("forced failure"))
        })
    })
    .await;
    assert!(result.is_err());

    // The failed scope unwound itself; the outer one keeps going.
    assert_eq!(session.depth(), 1);
    session.commit(outer).await.expect("outer commit");

    assert_eq!(repo.count(&mut session, None).await.expect("count"), 1);
    let kept = repo
        .get_by(&mut session, &predicate! {"name" => "kept"})
        .await
        .expect("get_by");
    assert!(kept.is_some());
    session.close().await;
}

#[tokio::test]
async fn test_three_levels_of_nesting() {
    let db = common::setup().await;
    let repo = Repository::<User>::new();

    let mut session = db.manager.open_session().await.expect("open session");

    let l0 = session.begin().await.expect("depth 0");
    let l1 = session.begin().await.expect("depth 1");
    let l2 = session.begin().await.expect("depth 2");
    assert_eq!((l0.depth(), l1.depth(), l2.depth()), (0, 1, 2));

    repo.create(&mut session, fields! {"name" => "deep", "active" => true})
        .await
        .expect("create at depth 3");

    session.commit(l2).await.expect("commit inner");
    session.rollback(l1).await.expect("rollback middle");
    session.commit(l0).await.expect("commit outer");
    session.close().await;

    // The middle rollback swallowed the inner scope's released write too.
    let mut session = db.manager.open_session().await.expect("open session");
    assert_eq!(repo.count(&mut session, None).await.expect("count"), 0);
    session.close().await;
}
