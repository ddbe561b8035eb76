//! Best-effort activity logging. A failed audit write never fails the
//! operation that produced it.

use orchestra_common::models::{ActivityType, NewActivity};
use orchestra_store::Store;
use tracing::warn;

pub async fn log_activity(
    store: &dyn Store,
    activity_type: ActivityType,
    message: impl Into<String>,
    entity: &str,
    entity_id: i64,
) {
    let activity = NewActivity {
        activity_type,
        message: message.into(),
        entity: entity.to_string(),
        entity_id,
        user_id: None,
        metadata: None,
    };
    if let Err(e) = store.record_activity(activity).await {
        warn!(entity, entity_id, "Failed to record activity: {}", e);
    }
}
