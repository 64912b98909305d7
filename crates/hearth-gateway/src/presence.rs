use std::time::Duration;

use tracing::error;

use hearth_db::Store;
use hearth_types::events::{EVENT_STATUS_CHANGE, WebSocketEvent};
use hearth_types::models::{STATUS_AWAY, STATUS_OFFLINE, STATUS_ONLINE, Status};
use hearth_types::now_millis;

use crate::hub::Hub;

async fn load_status(store: &dyn Store, user_id: &str) -> Option<Status> {
    match store.get_status(user_id).await {
        Ok(status) => Some(status),
        Err(e) if e.is_not_found() => Some(Status::offline(user_id)),
        Err(e) => {
            error!("status lookup for {} failed: {}", user_id, e);
            None
        }
    }
}

async fn save_and_broadcast(store: &dyn Store, hub: &Hub, status: Status, changed: bool) {
    let user_id = status.user_id.clone();
    let value = status.status.clone();
    if let Err(e) = store.save_status(status).await {
        error!("saving status for {} failed: {}", user_id, e);
        return;
    }
    if changed {
        let event = WebSocketEvent::new(EVENT_STATUS_CHANGE, "", "", &user_id)
            .with_data("status", value)
            .with_data("user_id", user_id.as_str());
        hub.publish(event).await;
    }
}

/// Mark the user online and bump their last activity. Manual statuses
/// (away, dnd set by the user) only get the activity bump.
pub async fn set_status_online(store: &dyn Store, hub: &Hub, user_id: &str) {
    let Some(mut status) = load_status(store, user_id).await else {
        return;
    };
    status.last_activity_at = now_millis();
    if status.manual && status.status != STATUS_ONLINE {
        save_and_broadcast(store, hub, status, false).await;
        return;
    }
    let changed = status.status != STATUS_ONLINE;
    status.status = STATUS_ONLINE.to_string();
    status.manual = false;
    save_and_broadcast(store, hub, status, changed).await;
}

/// Flip an idle user to away once `away_timeout` has passed since their
/// last activity.
pub async fn set_status_away_if_needed(store: &dyn Store, hub: &Hub, user_id: &str, away_timeout: Duration) {
    let Some(mut status) = load_status(store, user_id).await else {
        return;
    };
    if status.manual || status.status == STATUS_AWAY || status.status == STATUS_OFFLINE {
        return;
    }
    let idle_ms = now_millis() - status.last_activity_at;
    if idle_ms < away_timeout.as_millis() as i64 {
        return;
    }
    status.status = STATUS_AWAY.to_string();
    save_and_broadcast(store, hub, status, true).await;
}

/// The user's last connection went away.
pub async fn set_status_offline(store: &dyn Store, hub: &Hub, user_id: &str) {
    let Some(mut status) = load_status(store, user_id).await else {
        return;
    };
    if status.manual || status.status == STATUS_OFFLINE {
        return;
    }
    status.status = STATUS_OFFLINE.to_string();
    save_and_broadcast(store, hub, status, true).await;
}
