//! Event Router - maps a decoded envelope to its projection.
//!
//! Each queue carries one [`EventFamily`] and has its own dispatch table. The
//! recognized types form closed enums so adding a projection is a compile-time
//! checked change; everything else falls through to an explicit
//! `Unrecognized` arm that decodes nothing and builds nothing.
//!
//! ```text
//! Family  | Key              | Detail shape        | Mutation
//! --------|------------------|---------------------|-------------------
//! client  | LOGIN            | LoginDetails        | none
//! client  | REGISTER         | RegisterDetails     | insert (upsert)
//! client  | VERIFY_EMAIL     | VerifyEmailDetails  | update email_verified
//! admin   | DELETE           | AuthDetails         | soft delete
//! any     | anything else    | not decoded         | none
//! ```

use crate::details::{
    decode_detail, AuthDetails, DetailPayload, LoginDetails, RegisterDetails, VerifyEmailDetails,
};
use crate::event::{AdminEvent, ClientEvent, DecodeError, EventFamily};
use crate::mutation::ProjectedMutation;
use tracing::{debug, info};

/// Client event types with a dispatch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEventType {
    Login,
    Register,
    VerifyEmail,
    Unrecognized(String),
}

impl ClientEventType {
    /// Map the envelope's `type` string; matching is case-sensitive.
    pub fn from_wire(event_type: &str) -> Self {
        match event_type {
            "LOGIN" => ClientEventType::Login,
            "REGISTER" => ClientEventType::Register,
            "VERIFY_EMAIL" => ClientEventType::VerifyEmail,
            other => ClientEventType::Unrecognized(other.to_string()),
        }
    }
}

/// Admin operation types with a dispatch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminOperation {
    Delete,
    Unrecognized(String),
}

impl AdminOperation {
    /// Map the envelope's `operationType` string.
    pub fn from_wire(operation_type: &str) -> Self {
        match operation_type {
            "DELETE" => AdminOperation::Delete,
            other => AdminOperation::Unrecognized(other.to_string()),
        }
    }
}

/// Envelope fields worth carrying into logs after dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSummary {
    pub class: String,
    pub event_type: String,
    pub realm_id: String,
    pub user_id: Option<String>,
    pub time: String,
}

/// Result of routing a single envelope.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub summary: EventSummary,

    /// False when the type had no dispatch entry
    pub recognized: bool,

    pub detail: Option<DetailPayload>,
    pub mutation: Option<ProjectedMutation>,
}

impl Dispatch {
    fn unrecognized(summary: EventSummary) -> Self {
        Self {
            summary,
            recognized: false,
            detail: None,
            mutation: None,
        }
    }

    fn recognized(
        summary: EventSummary,
        detail: DetailPayload,
        mutation: Option<ProjectedMutation>,
    ) -> Self {
        Self {
            summary,
            recognized: true,
            detail: Some(detail),
            mutation,
        }
    }
}

/// A delivery that could not be routed.
///
/// `summary` is present whenever the envelope itself decoded, so failures in
/// the detail payload or resource path can still be logged with the event's
/// class, type, realm and user.
#[derive(Debug)]
pub struct DispatchError {
    pub summary: Option<EventSummary>,
    pub error: DecodeError,
}

impl DispatchError {
    fn after_envelope(summary: &EventSummary, error: DecodeError) -> Self {
        Self {
            summary: Some(summary.clone()),
            error,
        }
    }
}

impl From<DecodeError> for DispatchError {
    fn from(error: DecodeError) -> Self {
        Self {
            summary: None,
            error,
        }
    }
}

/// Decode and route a delivery body from the given family's queue.
pub fn dispatch(family: EventFamily, body: &[u8]) -> Result<Dispatch, DispatchError> {
    match family {
        EventFamily::Client => dispatch_client(&ClientEvent::decode(body)?),
        EventFamily::Admin => dispatch_admin(&AdminEvent::decode(body)?),
    }
}

/// Route a client event by its `type`.
pub fn dispatch_client(event: &ClientEvent) -> Result<Dispatch, DispatchError> {
    let summary = EventSummary {
        class: event.class.clone(),
        event_type: event.event_type.clone(),
        realm_id: event.realm_id.clone(),
        user_id: Some(event.user_id.clone()).filter(|id| !id.is_empty()),
        time: event.time(),
    };

    info!(
        time = %summary.time,
        event_type = %event.event_type,
        user_id = %event.user_id,
        realm_id = %event.realm_id,
        "Client event"
    );

    let details = event.details.as_deref();
    let reject = |error| DispatchError::after_envelope(&summary, error);

    match ClientEventType::from_wire(&event.event_type) {
        ClientEventType::Login => {
            let login: LoginDetails = decode_detail(details, &event.event_type).map_err(reject)?;
            debug!(user_id = %event.user_id, username = %login.username, "Login, nothing to project");
            Ok(Dispatch::recognized(summary, DetailPayload::Login(login), None))
        }
        ClientEventType::Register => {
            let register: RegisterDetails =
                decode_detail(details, &event.event_type).map_err(reject)?;
            let mutation = ProjectedMutation::register(&event.user_id, &register);
            Ok(Dispatch::recognized(
                summary,
                DetailPayload::Register(register),
                Some(mutation),
            ))
        }
        ClientEventType::VerifyEmail => {
            let verify: VerifyEmailDetails =
                decode_detail(details, &event.event_type).map_err(reject)?;
            debug!(
                user_id = %event.user_id,
                remember_me = verify.remember_me(),
                "Email verified"
            );
            let mutation = ProjectedMutation::verify_email(&event.user_id);
            Ok(Dispatch::recognized(
                summary,
                DetailPayload::VerifyEmail(verify),
                Some(mutation),
            ))
        }
        ClientEventType::Unrecognized(event_type) => {
            debug!(event_type = %event_type, "No projection for client event type");
            Ok(Dispatch::unrecognized(summary))
        }
    }
}

/// Route an admin event by its `operationType`.
pub fn dispatch_admin(event: &AdminEvent) -> Result<Dispatch, DispatchError> {
    let mut summary = EventSummary {
        class: event.class.clone(),
        event_type: event.operation_type.clone(),
        realm_id: event.realm_id.clone(),
        user_id: None,
        time: event.time(),
    };

    info!(
        time = %summary.time,
        operation_type = %event.operation_type,
        resource_path = %event.resource_path,
        realm_id = %event.realm_id,
        "Admin event"
    );

    match AdminOperation::from_wire(&event.operation_type) {
        AdminOperation::Delete => {
            let auth: AuthDetails = decode_detail(event.auth_details.as_deref(), &event.operation_type)
                .map_err(|e| DispatchError::after_envelope(&summary, e))?;
            let user_id = event
                .resource_id()
                .map_err(|e| DispatchError::after_envelope(&summary, e))?;
            summary.user_id = Some(user_id.to_string());

            debug!(
                user_id = %user_id,
                acting_user = %auth.user_id,
                "Admin delete"
            );

            let mutation = ProjectedMutation::soft_delete(user_id);
            Ok(Dispatch::recognized(
                summary,
                DetailPayload::AdminAuth(auth),
                Some(mutation),
            ))
        }
        AdminOperation::Unrecognized(operation) => {
            debug!(operation_type = %operation, "No projection for admin operation");
            Ok(Dispatch::unrecognized(summary))
        }
    }
}
