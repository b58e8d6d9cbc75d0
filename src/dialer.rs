//! Direct-dial race.
//!
//! One task per candidate address; the first established connection wins and
//! every other attempt is aborted. Failures are aggregated per address.

use multiaddr::Multiaddr;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::DialError;
use crate::identity::PeerId;
use crate::protocols::{ConnectionInfo, Host};

const PENDING_REASON: &str = "no response before deadline";
const TASK_FAILED_REASON: &str = "dial task failed";

/// Race direct dials to `addrs`, bounded by `deadline` and `cancel`.
pub async fn race_dial<H>(
    host: &H,
    peer: PeerId,
    addrs: &[Multiaddr],
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<ConnectionInfo, DialError>
where
    H: Host + Clone,
{
    if addrs.is_empty() {
        return Err(DialError::NoCandidates);
    }

    let mut join_set = JoinSet::new();
    for (idx, addr) in addrs.iter().cloned().enumerate() {
        let host = host.clone();
        join_set.spawn(async move {
            let result = host.dial(peer, addr).await;
            (idx, result)
        });
    }

    let mut failures: Vec<Option<String>> = vec![None; addrs.len()];
    let aggregate = |failures: &[Option<String>], pending_reason: &str| -> Vec<(Multiaddr, String)> {
        addrs
            .iter()
            .zip(failures)
            .map(|(addr, reason)| {
                let reason = reason.clone().unwrap_or_else(|| pending_reason.to_string());
                (addr.clone(), reason)
            })
            .collect()
    };

    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(DialError::Cancelled),
            joined = join_set.join_next() => match joined {
                Some(Ok((idx, Ok(conn)))) => {
                    debug!(
                        peer = ?peer,
                        addr = %addrs[idx],
                        conn_id = conn.id,
                        "direct dial won the race"
                    );
                    break Ok(conn);
                }
                Some(Ok((idx, Err(e)))) => {
                    trace!(peer = ?peer, addr = %addrs[idx], error = %e, "direct dial attempt failed");
                    failures[idx] = Some(e.to_string());
                }
                Some(Err(e)) => {
                    trace!(peer = ?peer, error = %e, "direct dial task did not complete");
                }
                None => break Err(DialError::AllFailed(aggregate(&failures, TASK_FAILED_REASON))),
            },
            _ = &mut sleep => {
                break Err(DialError::DeadlineReached(aggregate(&failures, PENDING_REASON)));
            }
        }
    };

    // Losers and stragglers are cancelled here.
    join_set.abort_all();
    outcome
}
