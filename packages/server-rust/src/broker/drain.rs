//! Offline backlog drain.
//!
//! Runs once per successful authentication, concurrently with the event
//! loop. Pages through the client's person-channel backlog and feeds it
//! into the same delivery inbox the live path uses. The cutoff timestamp
//! is what keeps the cold replay and the live commit stream from
//! delivering the same message twice: anything the live path pushes for
//! this channel is strictly newer than the cutoff. The event loop captures
//! it while handling the authentication event, not in this task, so no
//! commit the loop processes after registration can slip under it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use courier_core::model::ClientId;
use tracing::{debug, error, warn};

use super::Shared;

/// Hard cap on replayed pages; backlog beyond it stays persisted and is
/// not replayed this session.
pub(crate) const MAX_DRAIN_PAGES: u64 = 1000;

/// Messages fetched per page.
pub(crate) const DRAIN_PAGE_SIZE: u64 = 100;

/// Current wall-clock time in millisecond epoch.
pub(crate) fn now_ms() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

/// Replay a newly authenticated client's person-channel backlog.
///
/// `cutoff` is the registration instant in millisecond epoch, captured by
/// the caller before this task was spawned.
pub(crate) async fn run(shared: &Arc<Shared>, client_id: ClientId, cutoff: i64) {
    let channel = match Shared::get_channel(shared, client_id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            warn!(client_id, "no person channel to drain");
            return;
        }
        Err(err) => {
            error!(client_id, error = %err, "offline drain aborted");
            return;
        }
    };

    for page in 1..=MAX_DRAIN_PAGES {
        let msgs = match shared
            .storage
            .get_msg_in_channel(channel.id(), page, DRAIN_PAGE_SIZE)
            .await
        {
            Ok(msgs) => msgs,
            Err(err) => {
                error!(client_id, page, error = %err, "offline drain aborted mid-page");
                return;
            }
        };

        let fetched = msgs.len() as u64;
        for msg in msgs {
            if msg.timestamp > cutoff {
                // The live commit path owns this and every later message.
                debug!(client_id, message_id = msg.message_id, "live stream caught up; drain done");
                return;
            }
            if channel.enqueue(msg).await.is_err() {
                debug!(client_id, "delivery inbox closed; drain abandoned");
                return;
            }
        }

        if fetched < DRAIN_PAGE_SIZE {
            debug!(client_id, pages = page, "offline backlog drained");
            return;
        }
    }
    warn!(client_id, "drain page cap reached; remaining backlog deferred to next session");
}
