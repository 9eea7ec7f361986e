use crate::hub::Registry;
use crate::state::{Snapshot, Subscription};
use std::collections::HashMap;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Outcome of one fan-out. `dropped` counts payloads discarded because a
/// client queue was full, `closed` those addressed to a connection whose
/// receiving side is already gone, `unencodable` those that failed to
/// serialize.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub connections: u64,
    pub sent: u64,
    pub dropped: u64,
    pub closed: u64,
    pub unencodable: u64,
}

/// Delivers `snapshot` to every registered connection, filtered by its
/// subscription. Never waits on a client and never mutates the registry:
/// dead connections are reaped by their own gateway task.
pub async fn broadcast(snapshot: &Snapshot, registry: &Registry) -> BroadcastReport {
    let connections = registry.connections().await;
    let mut report = BroadcastReport {
        connections: connections.len() as u64,
        ..BroadcastReport::default()
    };
    if connections.is_empty() {
        return report;
    }

    // Serialized once per distinct subscription.
    let mut encoded: HashMap<Subscription, String> = HashMap::new();

    for conn in connections {
        let payload = match encoded.get(&conn.subscription) {
            Some(payload) => payload.clone(),
            None => match serde_json::to_string(&snapshot.payload_for(&conn.subscription)) {
                Ok(payload) => {
                    encoded.insert(conn.subscription.clone(), payload.clone());
                    payload
                }
                Err(err) => {
                    warn!(connection_id = conn.id, error = %err, "failed to encode payload");
                    report.unencodable += 1;
                    continue;
                }
            },
        };

        match conn.sender.try_send(payload) {
            Ok(()) => report.sent += 1,
            Err(TrySendError::Full(_)) => {
                report.dropped += 1;
                warn!(
                    connection_id = conn.id,
                    "client queue full, payload dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                report.closed += 1;
                warn!(
                    connection_id = conn.id,
                    "connection closed before delivery, skipped"
                );
            }
        }
    }

    debug!(
        connections = report.connections,
        sent = report.sent,
        dropped = report.dropped,
        closed = report.closed,
        unencodable = report.unencodable,
        "broadcast finished"
    );
    report
}
