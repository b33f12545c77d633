mod common;

use common::{memory_store, random_owner};
use std::sync::{Arc, Mutex};
use txledger::context::TxContext;
use txledger::domain::user::{CreateUserParams, CreateUserTxParams, UpdateUserParams};
use txledger::error::LedgerError;

fn user_params(username: &str) -> CreateUserParams {
    CreateUserParams {
        username: username.to_string(),
        hashed_password: "hash".to_string(),
        full_name: "Test User".to_string(),
        email: format!("{username}@example.com"),
    }
}

#[tokio::test]
async fn test_create_user_tx_runs_hook_with_new_user() {
    let (_, store) = memory_store();
    let ctx = TxContext::background();
    let username = random_owner();
    let seen = Arc::new(Mutex::new(None));

    let hook_seen = seen.clone();
    let result = store
        .create_user_tx(
            &ctx,
            CreateUserTxParams {
                params: user_params(&username),
                after_create: Box::new(move |user| {
                    *hook_seen.lock().unwrap() = Some(user.username.clone());
                    Ok(())
                }),
            },
        )
        .await
        .unwrap();

    assert_eq!(result.user.username, username);
    assert!(result.user.password_changed_at.is_none());
    assert_eq!(seen.lock().unwrap().as_deref(), Some(username.as_str()));
    assert_eq!(store.get_user(&ctx, &username).await.unwrap(), result.user);
}

#[tokio::test]
async fn test_failing_hook_rolls_back_user() {
    let (_, store) = memory_store();
    let ctx = TxContext::background();
    let username = random_owner();

    let err = store
        .create_user_tx(
            &ctx,
            CreateUserTxParams {
                params: user_params(&username),
                after_create: Box::new(|_| {
                    Err(LedgerError::ConnectionFailure("queue unavailable".to_string()))
                }),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::ConnectionFailure(_)));
    assert!(store.get_user(&ctx, &username).await.unwrap_err().is_not_found());

    // The username is free again.
    store.create_user(&ctx, user_params(&username)).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_username_and_email_are_constraint_violations() {
    let (_, store) = memory_store();
    let ctx = TxContext::background();
    store.create_user(&ctx, user_params("carol")).await.unwrap();

    let err = store.create_user(&ctx, user_params("carol")).await.unwrap_err();
    assert!(matches!(err, LedgerError::ConstraintViolation(_)));

    let mut params = user_params("dave");
    params.email = "carol@example.com".to_string();
    let err = store.create_user(&ctx, params).await.unwrap_err();
    assert!(matches!(err, LedgerError::ConstraintViolation(_)));
}

#[tokio::test]
async fn test_update_user_changes_only_given_fields() {
    let (_, store) = memory_store();
    let ctx = TxContext::background();
    let created = store.create_user(&ctx, user_params("erin")).await.unwrap();

    let updated = store
        .update_user(
            &ctx,
            UpdateUserParams {
                username: "erin".to_string(),
                full_name: Some("Erin Example".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.full_name, "Erin Example");
    assert_eq!(updated.email, created.email);
    assert_eq!(updated.hashed_password, created.hashed_password);
    assert!(updated.password_changed_at.is_none());
}
