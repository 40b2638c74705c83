use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Maximum size of a JSON-lines frame on the relay socket (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Identifier assigned to a connection when it joins the relay.
pub type SessionKey = String;

/// Nested request fields, grouped by domain object (`data.user.token`).
pub type FieldGroups = HashMap<String, HashMap<String, String>>;

/// Numeric response codes.
pub mod code {
    pub const OK: u16 = 200;

    /// Command-specific field and business failures (meaning depends on the command).
    pub const FAIL_1: u16 = 301;
    pub const FAIL_2: u16 = 302;
    pub const FAIL_3: u16 = 303;
    pub const FAIL_4: u16 = 304;

    pub const INVALID_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const STORAGE_UNAVAILABLE: u16 = 500;
    /// Every `SEND_STATUS_CHANGE` failure.
    pub const STATUS_CHANGE_FAILED: u16 = 501;
    pub const AT_CAPACITY: u16 = 503;
}

/// Presence values persisted per user.
pub mod status {
    pub const OFFLINE: &str = "0";
    pub const ONLINE: &str = "1";
}

// ---------------------------------------------------------------------------
// Command names
// ---------------------------------------------------------------------------

/// Command identifier carried by both request and response envelopes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandName {
    GetKeyReturn,
    GetConn,
    GetConnReturn,
    GetBuddyList,
    GetBuddyListReturn,
    CreateSession,
    CreateSessionReturn,
    SendMsg,
    SendMsgReturn,
    PushMsg,
    SendStatusChange,
    PushStatusChange,
    LogoutRequest,
    Unauthorized,
    InvalidRequest,
    /// Any command name this relay does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::GetKeyReturn => "GET_KEY_RETURN",
            CommandName::GetConn => "GET_CONN",
            CommandName::GetConnReturn => "GET_CONN_RETURN",
            CommandName::GetBuddyList => "GET_BUDDY_LIST",
            CommandName::GetBuddyListReturn => "GET_BUDDY_LIST_RETURN",
            CommandName::CreateSession => "CREATE_SESSION",
            CommandName::CreateSessionReturn => "CREATE_SESSION_RETURN",
            CommandName::SendMsg => "SEND_MSG",
            CommandName::SendMsgReturn => "SEND_MSG_RETURN",
            CommandName::PushMsg => "PUSH_MSG",
            CommandName::SendStatusChange => "SEND_STATUS_CHANGE",
            CommandName::PushStatusChange => "PUSH_STATUS_CHANGE",
            CommandName::LogoutRequest => "LOGOUT_REQUEST",
            CommandName::Unauthorized => "UNAUTHORIZED",
            CommandName::InvalidRequest => "INVALID_REQUEST",
            CommandName::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Raw request frame as it travels over the wire.
///
/// `{"command":"GET_CONN","data":{"user":{"token":"..."}}}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub command: CommandName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<FieldGroups>,
}

impl Envelope {
    pub fn new(command: CommandName) -> Self {
        Self {
            command,
            data: None,
        }
    }

    pub fn with_field(mut self, group: &str, field: &str, value: impl Into<String>) -> Self {
        self.data
            .get_or_insert_with(HashMap::new)
            .entry(group.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
        self
    }

    /// Field value, or the empty string when the group or field is missing.
    pub fn field(&self, group: &str, field: &str) -> &str {
        self.data
            .as_ref()
            .and_then(|groups| groups.get(group))
            .and_then(|fields| fields.get(field))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// A validated client request. Every variant's required fields are non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Bind the connection to a logged-in user.
    GetConn { token: String },
    GetBuddyList { token: String },
    /// Find or open the conversation between two users.
    CreateSession {
        sender: String,
        receiver: String,
        token: String,
    },
    SendMsg { ticket: String, content: String },
    SendStatusChange { token: String, status: String },
    LogoutRequest,
}

impl Request {
    pub fn command(&self) -> CommandName {
        match self {
            Request::GetConn { .. } => CommandName::GetConn,
            Request::GetBuddyList { .. } => CommandName::GetBuddyList,
            Request::CreateSession { .. } => CommandName::CreateSession,
            Request::SendMsg { .. } => CommandName::SendMsg,
            Request::SendStatusChange { .. } => CommandName::SendStatusChange,
            Request::LogoutRequest => CommandName::LogoutRequest,
        }
    }

    /// Validate a raw envelope. Missing fields are checked in declaration
    /// order and the first one wins.
    pub fn decode(envelope: &Envelope) -> Result<Self, Rejection> {
        match envelope.command {
            CommandName::GetConn => Ok(Request::GetConn {
                token: require(
                    envelope,
                    ("user", "token"),
                    code::FAIL_1,
                    "user token must not be empty",
                    CommandName::GetConnReturn,
                )?,
            }),
            CommandName::GetBuddyList => Ok(Request::GetBuddyList {
                token: require(
                    envelope,
                    ("user", "token"),
                    code::FAIL_1,
                    "user token must not be empty",
                    CommandName::GetBuddyListReturn,
                )?,
            }),
            CommandName::CreateSession => {
                let reply = CommandName::CreateSessionReturn;
                let sender = require(
                    envelope,
                    ("session", "sender"),
                    code::FAIL_1,
                    "sender must not be empty",
                    reply,
                )?;
                let receiver = require(
                    envelope,
                    ("session", "receiver"),
                    code::FAIL_2,
                    "receiver must not be empty",
                    reply,
                )?;
                let token = require(
                    envelope,
                    ("session", "token"),
                    code::FAIL_3,
                    "user token must not be empty",
                    reply,
                )?;
                Ok(Request::CreateSession {
                    sender,
                    receiver,
                    token,
                })
            }
            CommandName::SendMsg => {
                let reply = CommandName::SendMsgReturn;
                let ticket = require(
                    envelope,
                    ("message", "ticket"),
                    code::FAIL_1,
                    "ticket must not be empty",
                    reply,
                )?;
                let content = require(
                    envelope,
                    ("message", "content"),
                    code::FAIL_2,
                    "message content must not be empty",
                    reply,
                )?;
                Ok(Request::SendMsg { ticket, content })
            }
            CommandName::SendStatusChange => {
                let reply = CommandName::SendStatusChange;
                let token = require(
                    envelope,
                    ("user", "token"),
                    code::STATUS_CHANGE_FAILED,
                    "token must not be empty",
                    reply,
                )?;
                let status = require(
                    envelope,
                    ("user", "status"),
                    code::STATUS_CHANGE_FAILED,
                    "status must not be empty",
                    reply,
                )?;
                Ok(Request::SendStatusChange { token, status })
            }
            CommandName::LogoutRequest => Ok(Request::LogoutRequest),
            other => Err(Rejection::invalid(format!("unsupported command {other}"))),
        }
    }

    /// Build the wire envelope for this request.
    pub fn to_envelope(&self) -> Envelope {
        let envelope = Envelope::new(self.command());
        match self {
            Request::GetConn { token } | Request::GetBuddyList { token } => {
                envelope.with_field("user", "token", token)
            }
            Request::CreateSession {
                sender,
                receiver,
                token,
            } => envelope
                .with_field("session", "sender", sender)
                .with_field("session", "receiver", receiver)
                .with_field("session", "token", token),
            Request::SendMsg { ticket, content } => envelope
                .with_field("message", "ticket", ticket)
                .with_field("message", "content", content),
            Request::SendStatusChange { token, status } => envelope
                .with_field("user", "token", token)
                .with_field("user", "status", status),
            Request::LogoutRequest => envelope,
        }
    }
}

fn require(
    envelope: &Envelope,
    (group, field): (&str, &str),
    code: u16,
    message: &str,
    reply: CommandName,
) -> Result<String, Rejection> {
    let value = envelope.field(group, field);
    if value.is_empty() {
        return Err(Rejection::new(code, message, reply));
    }
    Ok(value.to_string())
}

/// A request failure reported back to the originating connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{command} {code}: {message}")]
pub struct Rejection {
    pub code: u16,
    pub message: String,
    pub command: CommandName,
}

impl Rejection {
    pub fn new(code: u16, message: impl Into<String>, command: CommandName) -> Self {
        Self {
            code,
            message: message.into(),
            command,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(code::INVALID_REQUEST, message, CommandName::InvalidRequest)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            code::UNAUTHORIZED,
            "user is not logged in",
            CommandName::Unauthorized,
        )
    }

    pub fn storage(command: CommandName) -> Self {
        Self::new(code::STORAGE_UNAVAILABLE, "storage unavailable", command)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A frame sent from the relay to a client: a reply or a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: u16,
    pub message: String,
    pub command: CommandName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    /// Successful frame whose data is `{group: value}`.
    pub fn with_data(command: CommandName, group: &str, value: serde_json::Value) -> Self {
        let mut data = serde_json::Map::new();
        data.insert(group.to_string(), value);
        Self {
            code: code::OK,
            message: "OK".to_string(),
            command,
            data: Some(serde_json::Value::Object(data)),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == code::OK
    }

    /// Deserialize `data.<group>` into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self, group: &str) -> Option<T> {
        let value = self.data.as_ref()?.get(group)?;
        serde_json::from_value(value.clone()).ok()
    }
}

impl From<Rejection> for Response {
    fn from(rejection: Rejection) -> Self {
        Self {
            code: rejection.code,
            message: rejection.message,
            command: rejection.command,
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Data types carried in Response.data
// ---------------------------------------------------------------------------

/// `GET_KEY_RETURN` payload under `conn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key: SessionKey,
}

/// `GET_CONN_RETURN` payload under `conn`: rows written for the connection record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnStatus {
    pub status: u64,
}

/// `CREATE_SESSION_RETURN` payload under `session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTicket {
    pub ticket: String,
    pub receiver: String,
}

/// `PUSH_MSG` payload under `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedMessage {
    pub sender: String,
    pub ticket: String,
    pub content: String,
}

/// `PUSH_STATUS_CHANGE` payload under `user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    pub id: String,
    pub state: String,
}

/// A buddy group returned by `GET_BUDDY_LIST` under `categories`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyCategory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub buddies: Vec<Buddy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buddy {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_json(json: &str) -> Result<Request, Rejection> {
        let envelope: Envelope = serde_json::from_str(json).unwrap();
        Request::decode(&envelope)
    }

    #[test]
    fn get_conn_decodes_nested_token() {
        let req = decode_json(r#"{"command":"GET_CONN","data":{"user":{"token":"tA"}}}"#).unwrap();
        assert_eq!(
            req,
            Request::GetConn {
                token: "tA".to_string()
            }
        );
    }

    #[test]
    fn get_conn_without_token_is_301() {
        let err = decode_json(r#"{"command":"GET_CONN","data":{"user":{"token":""}}}"#).unwrap_err();
        assert_eq!(err.code, code::FAIL_1);
        assert_eq!(err.command, CommandName::GetConnReturn);

        let err = decode_json(r#"{"command":"GET_CONN"}"#).unwrap_err();
        assert_eq!(err.code, code::FAIL_1);
    }

    #[test]
    fn create_session_first_missing_field_wins() {
        let err = decode_json(r#"{"command":"CREATE_SESSION","data":{"session":{}}}"#).unwrap_err();
        assert_eq!(err.code, 301);

        let err = decode_json(
            r#"{"command":"CREATE_SESSION","data":{"session":{"sender":"a","token":"t"}}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code, 302);

        let err = decode_json(
            r#"{"command":"CREATE_SESSION","data":{"session":{"sender":"a","receiver":"b"}}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code, 303);
        assert_eq!(err.command, CommandName::CreateSessionReturn);
    }

    #[test]
    fn send_msg_field_codes() {
        let err = decode_json(r#"{"command":"SEND_MSG","data":{"message":{"content":"hi"}}}"#)
            .unwrap_err();
        assert_eq!((err.code, err.command), (301, CommandName::SendMsgReturn));

        let err = decode_json(r#"{"command":"SEND_MSG","data":{"message":{"ticket":"t1"}}}"#)
            .unwrap_err();
        assert_eq!((err.code, err.command), (302, CommandName::SendMsgReturn));
    }

    #[test]
    fn status_change_failures_are_501() {
        let err = decode_json(r#"{"command":"SEND_STATUS_CHANGE","data":{"user":{"status":"1"}}}"#)
            .unwrap_err();
        assert_eq!((err.code, err.command), (501, CommandName::SendStatusChange));

        let err = decode_json(r#"{"command":"SEND_STATUS_CHANGE","data":{"user":{"token":"t"}}}"#)
            .unwrap_err();
        assert_eq!(err.code, 501);
    }

    #[test]
    fn unknown_command_name_is_rejected_as_invalid() {
        let envelope: Envelope = serde_json::from_str(r#"{"command":"SELF_DESTRUCT"}"#).unwrap();
        assert_eq!(envelope.command, CommandName::Unknown);
        let err = Request::decode(&envelope).unwrap_err();
        assert_eq!(err.code, code::INVALID_REQUEST);
    }

    #[test]
    fn response_command_is_screaming_snake_case() {
        let resp = Response::with_data(
            CommandName::GetKeyReturn,
            "conn",
            serde_json::json!({ "key": "k1" }),
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["command"], "GET_KEY_RETURN");
        assert_eq!(json["code"], 200);
        assert_eq!(json["data"]["conn"]["key"], "k1");

        let info: KeyInfo = resp.payload("conn").unwrap();
        assert_eq!(info.key, "k1");
    }

    #[test]
    fn rejection_response_omits_data() {
        let resp: Response = Rejection::unauthorized().into();
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"data\""));
        assert!(json.contains("\"UNAUTHORIZED\""));
        assert_eq!(resp.code, 401);
    }

    #[test]
    fn to_envelope_matches_decode() {
        let req = Request::CreateSession {
            sender: "u1".to_string(),
            receiver: "u2".to_string(),
            token: "tA".to_string(),
        };
        let envelope = req.to_envelope();
        assert_eq!(envelope.field("session", "receiver"), "u2");
        assert_eq!(Request::decode(&envelope).unwrap(), req);
    }
}
