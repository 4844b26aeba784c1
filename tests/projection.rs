//! End-to-end projection through the pipeline into an in-memory user table
//! that applies mutations with the same upsert semantics as the database.

use async_trait::async_trait;
use keybridge::dlq::RetryLimit;
use keybridge::executor::{ExecutionError, ExecutionResult, MutationExecutor};
use keybridge::mutation::{MutationOp, ProjectedMutation};
use keybridge::{AckDecision, EventFamily, Outcome, Pipeline};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Applies mutations to an in-memory `user` table.
#[derive(Default)]
struct UserTable {
    rows: Mutex<HashMap<String, Map<String, Value>>>,
    applied: Mutex<Vec<ProjectedMutation>>,
}

impl UserTable {
    fn row(&self, id: &str) -> Option<Map<String, Value>> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    fn applied(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

#[async_trait]
impl MutationExecutor for UserTable {
    fn name(&self) -> &str {
        "memory"
    }

    async fn execute(&self, mutation: &ProjectedMutation) -> Result<ExecutionResult, ExecutionError> {
        let mut rows = self.rows.lock().unwrap();
        let id = mutation.target_id.clone();

        match &mutation.operation {
            MutationOp::Insert { update_on_conflict } => match rows.get_mut(&id) {
                Some(row) => {
                    for column in update_on_conflict.iter() {
                        if let Some(value) = mutation.fields.get(*column) {
                            row.insert(column.to_string(), value.clone());
                        }
                    }
                }
                None => {
                    let mut row = mutation.fields.clone();
                    row.insert("id".into(), json!(id));
                    rows.insert(id.clone(), row);
                }
            },
            MutationOp::UpdateField | MutationOp::SoftDelete => {
                // update_by_pk on a missing row affects nothing and returns null
                let Some(row) = rows.get_mut(&id) else {
                    self.applied.lock().unwrap().push(mutation.clone());
                    return Ok(ExecutionResult::success("memory", Value::Null));
                };
                row.extend(mutation.fields.clone());
            }
        }

        self.applied.lock().unwrap().push(mutation.clone());
        Ok(ExecutionResult::success("memory", json!({ "id": id })))
    }
}

fn client_event(event_type: &str, user_id: &str, details: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "@class": "com.github.aznamier.keycloak.event.provider.EventClientNotificationMqMsg",
        "time": 1_700_000_000_000_i64,
        "type": event_type,
        "realmId": "app",
        "clientId": "web",
        "userId": user_id,
        "ipAddress": "10.0.0.1",
        "details": details
    }))
    .unwrap()
}

fn register(user_id: &str, first_name: &str) -> Vec<u8> {
    client_event(
        "REGISTER",
        user_id,
        json!({
            "auth_method": "openid-connect",
            "first_name": first_name,
            "last_name": "B",
            "email": "a@b.com",
            "username": "ab"
        }),
    )
}

fn admin_delete(resource_path: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "@class": "com.github.aznamier.keycloak.event.provider.EventAdminNotificationMqMsg",
        "time": 1_700_000_000_000_i64,
        "realmId": "app",
        "authDetails": {
            "realmId": "master",
            "clientId": "admin-cli",
            "userId": "admin-1",
            "ipAddress": "10.0.0.2"
        },
        "resourceType": "USER",
        "operationType": "DELETE",
        "resourcePath": resource_path
    }))
    .unwrap()
}

fn pipeline() -> (Arc<UserTable>, Pipeline) {
    let table = Arc::new(UserTable::default());
    (table.clone(), Pipeline::new(table))
}

#[tokio::test]
async fn test_register_creates_user_row() {
    let (table, pipeline) = pipeline();

    let outcome = pipeline.process(EventFamily::Client, &register("u1", "A")).await;
    assert!(matches!(outcome, Outcome::Applied(_)));
    assert_eq!(outcome.decision(), AckDecision::Acknowledge);

    let row = table.row("u1").unwrap();
    assert_eq!(row["first_name"], "A");
    assert_eq!(row["last_name"], "B");
    assert_eq!(row["username"], "ab");
    assert_eq!(row["email"], "a@b.com");
    assert_eq!(row["email_verified"], false);
    assert_eq!(row["deleted"], false);
}

#[tokio::test]
async fn test_replayed_register_keeps_verification() {
    let (table, pipeline) = pipeline();

    pipeline.process(EventFamily::Client, &register("u1", "A")).await;
    pipeline
        .process(EventFamily::Client, &client_event("VERIFY_EMAIL", "u1", json!({"email": "a@b.com"})))
        .await;
    let outcome = pipeline.process(EventFamily::Client, &register("u1", "Alice")).await;

    assert_eq!(outcome.decision(), AckDecision::Acknowledge);
    let row = table.row("u1").unwrap();
    assert_eq!(row["email_verified"], true);
    assert_eq!(row["first_name"], "Alice");
    assert_eq!(table.applied(), 3);
}

#[tokio::test]
async fn test_replayed_register_keeps_deletion() {
    let (table, pipeline) = pipeline();

    pipeline.process(EventFamily::Client, &register("u1", "A")).await;
    pipeline.process(EventFamily::Admin, &admin_delete("users/u1")).await;
    pipeline.process(EventFamily::Client, &register("u1", "A")).await;

    assert_eq!(table.row("u1").unwrap()["deleted"], true);
}

#[tokio::test]
async fn test_verify_email_is_idempotent() {
    let (table, pipeline) = pipeline();
    pipeline.process(EventFamily::Client, &register("u1", "A")).await;

    let verify = client_event("VERIFY_EMAIL", "u1", json!({}));
    pipeline.process(EventFamily::Client, &verify).await;
    let first = table.row("u1");
    let outcome = pipeline.process(EventFamily::Client, &verify).await;

    assert_eq!(outcome.decision(), AckDecision::Acknowledge);
    assert_eq!(table.row("u1"), first);
}

#[tokio::test]
async fn test_admin_delete_of_sub_resource_targets_user() {
    let (table, pipeline) = pipeline();
    pipeline.process(EventFamily::Client, &register("u1", "A")).await;

    let outcome = pipeline.process(EventFamily::Admin, &admin_delete("users/u1/sessions")).await;

    assert_eq!(outcome.decision(), AckDecision::Acknowledge);
    assert_eq!(table.row("u1").unwrap()["deleted"], true);
}

#[tokio::test]
async fn test_admin_delete_with_short_path_is_requeued() {
    let (table, pipeline) = pipeline();

    let outcome = pipeline.process(EventFamily::Admin, &admin_delete("users")).await;

    assert!(matches!(outcome, Outcome::DecodeFailed(_)));
    assert_eq!(outcome.decision(), AckDecision::RequeueAndRetry);
    assert_eq!(table.applied(), 0);
}

#[tokio::test]
async fn test_malformed_register_detail_is_requeued_without_write() {
    let (table, pipeline) = pipeline();

    let outcome = pipeline
        .process(EventFamily::Client, &client_event("REGISTER", "u1", json!(["not", "an", "object"])))
        .await;

    assert_eq!(outcome.decision(), AckDecision::RequeueAndRetry);
    assert_eq!(table.applied(), 0);
    assert!(table.row("u1").is_none());
}

#[tokio::test]
async fn test_array_payloads_are_requeued_without_write() {
    let (table, pipeline) = pipeline();
    pipeline.process(EventFamily::Client, &register("u1", "A")).await;

    let mut delete = serde_json::from_slice::<Value>(&admin_delete("users/u1")).unwrap();
    delete["authDetails"] = json!(["master", "admin-cli", "admin-1"]);
    let outcome = pipeline
        .process(EventFamily::Admin, &serde_json::to_vec(&delete).unwrap())
        .await;
    assert_eq!(outcome.decision(), AckDecision::RequeueAndRetry);

    let envelope = br#"["EventClientNotificationMqMsg", 0, "VERIFY_EMAIL", "app", "web", "u1"]"#;
    let outcome = pipeline.process(EventFamily::Client, envelope).await;
    assert_eq!(outcome.decision(), AckDecision::RequeueAndRetry);

    let row = table.row("u1").unwrap();
    assert_eq!(row["deleted"], false);
    assert_eq!(row["email_verified"], false);
    assert_eq!(table.applied(), 1);
}

#[tokio::test]
async fn test_null_details_decode_as_empty() {
    let (table, pipeline) = pipeline();
    pipeline.process(EventFamily::Client, &register("u1", "A")).await;

    let login = client_event("LOGIN", "u1", Value::Null);
    assert_eq!(
        pipeline.process(EventFamily::Client, &login).await.decision(),
        AckDecision::Acknowledge
    );

    let verify = client_event("VERIFY_EMAIL", "u1", Value::Null);
    assert_eq!(
        pipeline.process(EventFamily::Client, &verify).await.decision(),
        AckDecision::Acknowledge
    );
    assert_eq!(table.row("u1").unwrap()["email_verified"], true);
}

#[tokio::test]
async fn test_login_and_unknown_types_write_nothing() {
    let (table, pipeline) = pipeline();

    let login = client_event("LOGIN", "u1", json!({"auth_method": "openid-connect", "username": "ab"}));
    let refresh = client_event("REFRESH_TOKEN", "u1", json!({}));

    for body in [login, refresh] {
        let outcome = pipeline.process(EventFamily::Client, &body).await;
        assert_eq!(outcome.decision(), AckDecision::Acknowledge);
    }
    assert_eq!(table.applied(), 0);
}

/// Always rejects, as an unreachable endpoint would.
struct Unavailable;

#[async_trait]
impl MutationExecutor for Unavailable {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn execute(&self, _mutation: &ProjectedMutation) -> Result<ExecutionResult, ExecutionError> {
        Err(ExecutionError::Status {
            status: 503,
            body: "service unavailable".into(),
        })
    }
}

#[tokio::test]
async fn test_executor_failure_requeues_until_limit() {
    let pipeline = Pipeline::new(Arc::new(Unavailable)).with_retry_limit(RetryLimit::new(3));
    let body = register("u1", "A");

    let outcome = pipeline.process(EventFamily::Client, &body).await;
    assert!(matches!(outcome, Outcome::ExecutionFailed(_)));

    assert_eq!(pipeline.decide(&outcome, Some(0)), AckDecision::RequeueAndRetry);
    assert_eq!(pipeline.decide(&outcome, Some(1)), AckDecision::RequeueAndRetry);
    assert_eq!(pipeline.decide(&outcome, Some(2)), AckDecision::DeadLetter);
    // Unknown history never dead-letters
    assert_eq!(pipeline.decide(&outcome, None), AckDecision::RequeueAndRetry);
}

#[tokio::test]
async fn test_executor_failure_requeues_forever_by_default() {
    let pipeline = Pipeline::new(Arc::new(Unavailable));
    let outcome = pipeline.process(EventFamily::Client, &register("u1", "A")).await;

    assert_eq!(pipeline.decide(&outcome, Some(10_000)), AckDecision::RequeueAndRetry);
}
