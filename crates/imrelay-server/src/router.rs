//! Command handlers run by the dispatcher for each inbound request.
//!
//! `GET_CONN` is the only command served before a session is authenticated.
//! Every failure goes back to the originating session as a response; none of
//! them close the connection.

use crate::event::Inbound;
use crate::gateway::{Gateway, release_user};
use crate::session::Login;
use crate::table::ClientTable;
use imrelay::protocol::{CommandName, Rejection, Request, Response, code, status};
use imrelay_store::StoreError;
use serde_json::json;
use tracing::{debug, info, warn};

type Outcome = Result<Option<Response>, Rejection>;

pub async fn route(clients: &mut ClientTable, gateway: &Gateway, inbound: Inbound) {
    let Inbound {
        key,
        command,
        request,
    } = inbound;

    let Some(authenticated) = clients.get(&key).map(|s| s.is_authenticated()) else {
        debug!(key = %key, command = %command, "request from departed session dropped");
        return;
    };
    debug!(key = %key, command = %command, authenticated, "request");

    let outcome = match request {
        Ok(Request::GetConn { token }) => get_conn(clients, gateway, &key, token).await,
        Err(rejection) if command == CommandName::GetConn => Err(rejection),
        _ if !authenticated => Err(Rejection::unauthorized()),
        Err(rejection) => Err(rejection),
        Ok(Request::GetBuddyList { token }) => get_buddy_list(gateway, token).await,
        Ok(Request::CreateSession {
            sender, receiver, ..
        }) => create_session(gateway, sender, receiver).await,
        Ok(Request::SendMsg { ticket, content }) => {
            send_msg(clients, gateway, &key, ticket, content).await
        }
        Ok(Request::SendStatusChange { token, status }) => {
            send_status_change(clients, gateway, token, status).await
        }
        Ok(Request::LogoutRequest) => {
            if let Some(session) = clients.get(&key) {
                info!(key = %key, user_id = ?session.user_id(), "logout requested");
                session.terminate();
            }
            Ok(None)
        }
    };

    match outcome {
        Ok(Some(response)) => {
            clients.deliver(&key, response);
        }
        Ok(None) => {}
        Err(rejection) => {
            debug!(key = %key, code = rejection.code, message = %rejection.message, "request rejected");
            clients.deliver(&key, rejection.into());
        }
    }
}

fn storage_failure(reply: CommandName, e: StoreError) -> Rejection {
    warn!(command = %reply, err = %e, "storage call failed");
    Rejection::storage(reply)
}

async fn get_conn(clients: &mut ClientTable, gateway: &Gateway, key: &str, token: String) -> Outcome {
    let reply = CommandName::GetConnReturn;

    let lookup = token.clone();
    let login = gateway
        .call(move |s| s.login_by_token(&lookup))
        .await
        .map_err(|e| storage_failure(reply, e))?;
    let Some(login) = login.filter(|l| l.token.eq_ignore_ascii_case(&token)) else {
        return Err(Rejection::new(code::FAIL_2, "user token is invalid", reply));
    };
    if login.id.is_empty() || login.user_id.is_empty() {
        return Err(Rejection::new(code::FAIL_3, "user is not logged in", reply));
    }

    // A session that is already bound gives up its record before rebinding.
    let previous = clients
        .get(key)
        .and_then(|s| s.user_id())
        .map(str::to_string);
    let rebinding = previous.is_some();
    let (conn_key, user_id, conn_token) = (key.to_string(), login.user_id.clone(), token.clone());
    let bound = gateway
        .call(move |s| {
            if previous.is_some() {
                s.delete_conn_by_key(&conn_key)?;
            }
            let rows = match s.conn_by_token(&conn_token)? {
                Some(_) => s.update_conn_by_token(&conn_key, &user_id, &conn_token)?,
                None => s.add_conn(&conn_key, &user_id, &conn_token)?,
            };
            if !s.update_user_status(&user_id, status::ONLINE)? {
                s.delete_conn_by_key(&conn_key)?;
                if let Some(previous) = &previous {
                    release_user(s, previous)?;
                }
                return Ok(None);
            }
            if let Some(previous) = previous.filter(|p| *p != user_id) {
                release_user(s, &previous)?;
            }
            Ok(Some(rows))
        })
        .await;

    let rows = match bound {
        Ok(Some(rows)) => rows,
        Ok(None) => {
            unbind(clients, key, rebinding);
            return Err(Rejection::new(code::FAIL_4, "failed to set user status", reply));
        }
        Err(e) => {
            unbind(clients, key, rebinding);
            return Err(storage_failure(reply, e));
        }
    };

    info!(key = %key, user_id = %login.user_id, "session authenticated");
    if let Some(session) = clients.get_mut(key) {
        session.login = Some(Login {
            id: login.id,
            user_id: login.user_id,
            token,
        });
    }
    Ok(Some(Response::with_data(reply, "conn", json!({ "status": rows }))))
}

/// Drop a binding whose connection record may already be gone.
fn unbind(clients: &mut ClientTable, key: &str, rebinding: bool) {
    if !rebinding {
        return;
    }
    if let Some(session) = clients.get_mut(key) {
        warn!(key = %key, user_id = ?session.user_id(), "rebind failed, session unbound");
        session.login = None;
    }
}

async fn get_buddy_list(gateway: &Gateway, token: String) -> Outcome {
    let reply = CommandName::GetBuddyListReturn;
    let categories = gateway
        .call(move |s| {
            let categories = s.categories_by_token(&token)?;
            s.buddies_by_categories(categories)
        })
        .await
        .map_err(|e| storage_failure(reply, e))?;
    Ok(Some(Response::with_data(reply, "categories", json!(categories))))
}

async fn create_session(gateway: &Gateway, sender: String, receiver: String) -> Outcome {
    let reply = CommandName::CreateSessionReturn;

    let (s1, r1) = (sender.clone(), receiver.clone());
    let existing = gateway
        .call(move |s| s.conversation_by_sender_receiver(&s1, &r1))
        .await
        .map_err(|e| storage_failure(reply, e))?;

    let ticket = match existing {
        Some(conversation) => conversation.id,
        None => {
            let r2 = receiver.clone();
            gateway
                .call(move |s| s.add_conversation(&sender, &r2))
                .await
                .unwrap_or_else(|e| {
                    warn!(err = %e, "conversation insert failed");
                    String::new()
                })
        }
    };
    if ticket.is_empty() {
        return Err(Rejection::new(code::FAIL_4, "failed to create session", reply));
    }

    Ok(Some(Response::with_data(
        reply,
        "session",
        json!({ "ticket": ticket, "receiver": receiver }),
    )))
}

async fn send_msg(
    clients: &ClientTable,
    gateway: &Gateway,
    key: &str,
    ticket: String,
    content: String,
) -> Outcome {
    let reply = CommandName::SendMsgReturn;
    let sender = clients
        .get(key)
        .and_then(|s| s.user_id())
        .unwrap_or_default()
        .to_string();

    let lookup = ticket.clone();
    let keys = gateway
        .call(move |s| match s.conversation_by_id(&lookup)? {
            Some(_) => s.receiver_keys_by_ticket(&lookup).map(Some),
            None => Ok(None),
        })
        .await
        .map_err(|e| storage_failure(reply, e))?;
    let Some(keys) = keys else {
        return Err(Rejection::new(code::FAIL_3, "conversation is closed", reply));
    };

    let push = Response::with_data(
        CommandName::PushMsg,
        "message",
        json!({ "sender": sender, "ticket": ticket, "content": content }),
    );
    let mut reached = 0usize;
    for receiver in keys.iter().filter(|k| clients.contains(k)) {
        if clients.deliver(receiver, push.clone()) {
            reached += 1;
        }
    }
    debug!(key = %key, ticket = %ticket, candidates = keys.len(), reached, "message routed");

    if reached == 0 {
        return Err(Rejection::new(code::FAIL_4, "recipient is offline", reply));
    }
    Ok(None)
}

fn status_failed(message: &str) -> Rejection {
    Rejection::new(
        code::STATUS_CHANGE_FAILED,
        message,
        CommandName::SendStatusChange,
    )
}

async fn send_status_change(
    clients: &ClientTable,
    gateway: &Gateway,
    token: String,
    state: String,
) -> Outcome {
    let user = gateway
        .call(move |s| s.user_by_token(&token))
        .await
        .map_err(|e| {
            warn!(err = %e, "user lookup failed");
            status_failed("status change failed, please retry")
        })?;
    let Some(user) = user else {
        return Err(status_failed("token is invalid"));
    };
    // Only a status equal to the stored one is accepted.
    if !user.status.eq_ignore_ascii_case(&state) {
        return Err(status_failed("please log out and log in again"));
    }

    let (user_id, new_state) = (user.id.clone(), state.clone());
    let keys = gateway
        .call(move |s| {
            if !s.update_user_status(&user_id, &new_state)? {
                return Ok(None);
            }
            s.buddy_keys_by_user_id(&user_id).map(Some)
        })
        .await
        .unwrap_or_else(|e| {
            warn!(err = %e, "status update failed");
            None
        });
    let Some(keys) = keys else {
        return Err(status_failed("status change failed, please retry"));
    };

    let push = Response::with_data(
        CommandName::PushStatusChange,
        "user",
        json!({ "id": user.id, "state": state }),
    );
    for buddy in keys.iter().filter(|k| clients.contains(k)) {
        clients.deliver(buddy, push.clone());
    }
    debug!(user_id = %user.id, state = %state, notified = keys.len(), "status change pushed");
    Ok(None)
}
