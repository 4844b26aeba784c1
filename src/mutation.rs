//! Projection of events into downstream `user` mutations.
//!
//! | event | operation | fields |
//! |---|---|---|
//! | `REGISTER` | insert, on conflict update names only | full user row, `email_verified=false`, `deleted=false` |
//! | `VERIFY_EMAIL` | update by primary key | `email_verified=true` |
//! | admin `DELETE` | update by primary key | `deleted=true` |
//!
//! A [`ProjectedMutation`] is built fresh for each delivery and rendered to a
//! GraphQL document plus variables by [`ProjectedMutation::to_graphql`].

use crate::details::RegisterDetails;
use serde_json::{json, Map, Value};

/// Columns a re-registration may overwrite. Verification and deletion state
/// recorded downstream must survive a replayed `REGISTER`.
pub const REGISTER_CONFLICT_COLUMNS: &[&str] = &["first_name", "last_name"];

/// Upsert keyed on `user_pkey`; a collision updates only `update_columns`.
fn insert_user(update_columns: &[&str]) -> String {
    format!(
        r#"mutation($user: user_insert_input!) {{
  insert_user(
    objects: [$user],
    on_conflict: {{ constraint: user_pkey, update_columns: [{}] }}
  ) {{
    returning {{ id }}
  }}
}}"#,
        update_columns.join(", ")
    )
}

const UPDATE_USER_BY_PK: &str = r#"mutation($set: user_set_input!, $user_id: user_pk_columns_input!) {
  update_user_by_pk(_set: $set, pk_columns: $user_id) {
    id
  }
}"#;

/// The kind of write a projection performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
    /// Insert, or on primary key collision update only `update_on_conflict`
    Insert { update_on_conflict: &'static [&'static str] },

    /// Set the given fields on an existing row
    UpdateField,

    /// Flag an existing row as deleted
    SoftDelete,
}

impl MutationOp {
    /// Short label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Insert { .. } => "insert",
            MutationOp::UpdateField => "update",
            MutationOp::SoftDelete => "soft-delete",
        }
    }
}

/// A mutation against the downstream `user` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedMutation {
    pub operation: MutationOp,
    pub target_id: String,
    pub fields: Map<String, Value>,
}

/// A GraphQL document and its variable bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphqlRequest {
    pub query: String,
    pub variables: Value,
}

impl ProjectedMutation {
    /// `REGISTER`: upsert the user row, keyed by the event's user id.
    pub fn register(user_id: &str, details: &RegisterDetails) -> Self {
        let mut fields = Map::new();
        fields.insert("first_name".into(), json!(details.first_name));
        fields.insert("last_name".into(), json!(details.last_name));
        fields.insert("username".into(), json!(details.username));
        fields.insert("email".into(), json!(details.email));
        fields.insert("email_verified".into(), json!(false));
        fields.insert("deleted".into(), json!(false));

        Self {
            operation: MutationOp::Insert {
                update_on_conflict: REGISTER_CONFLICT_COLUMNS,
            },
            target_id: user_id.to_string(),
            fields,
        }
    }

    /// `VERIFY_EMAIL`: mark the user's email as verified.
    pub fn verify_email(user_id: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("email_verified".into(), json!(true));

        Self {
            operation: MutationOp::UpdateField,
            target_id: user_id.to_string(),
            fields,
        }
    }

    /// Admin `DELETE`: soft-delete the user.
    pub fn soft_delete(user_id: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("deleted".into(), json!(true));

        Self {
            operation: MutationOp::SoftDelete,
            target_id: user_id.to_string(),
            fields,
        }
    }

    /// Render as a Hasura GraphQL mutation.
    pub fn to_graphql(&self) -> GraphqlRequest {
        match self.operation {
            MutationOp::Insert { update_on_conflict } => {
                let mut user = Map::with_capacity(self.fields.len() + 1);
                user.insert("id".into(), json!(self.target_id));
                user.extend(self.fields.clone());

                GraphqlRequest {
                    query: insert_user(update_on_conflict),
                    variables: json!({ "user": user }),
                }
            }
            MutationOp::UpdateField | MutationOp::SoftDelete => GraphqlRequest {
                query: UPDATE_USER_BY_PK.to_string(),
                variables: json!({
                    "set": self.fields,
                    "user_id": { "id": self.target_id },
                }),
            },
        }
    }
}
