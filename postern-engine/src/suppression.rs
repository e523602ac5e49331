//! Suppression list gate.
//!
//! Every send path asks the store, never a cache, whether a recipient may receive
//! mail; entries are write-once per `(tenant, address)`.

use tracing::info;

use crate::error::Result;
use crate::model::{OrgId, Suppression, SuppressionSource};
use crate::store::DeliveryStore;

/// Reason recorded when the provider reports a hard bounce.
pub const REASON_HARD_BOUNCE: &str = "hard_bounce";
/// Reason recorded for spam complaints.
pub const REASON_COMPLAINT: &str = "complaint";
/// Reason recorded when a send fails permanently.
pub const REASON_PERMANENT_FAILURE: &str = "Permanent delivery failure";

/// Addresses among `recipients` that are suppressed for `org_id`.
pub async fn suppressed_recipients<'a, I>(
    store: &dyn DeliveryStore,
    org_id: OrgId,
    recipients: I,
) -> Result<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut blocked = Vec::new();
    for address in recipients {
        if store.is_suppressed(org_id, address).await? {
            blocked.push(address.to_string());
        }
    }
    Ok(blocked)
}

/// Suppress each address. Returns how many new entries were written.
pub async fn suppress_all<'a, I>(
    store: &dyn DeliveryStore,
    org_id: OrgId,
    addresses: I,
    reason: &str,
    source: SuppressionSource,
) -> Result<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut added = 0;
    for address in addresses {
        if store
            .suppress(Suppression::new(org_id, address, reason, source))
            .await?
        {
            info!(org_id, email = %address, reason, source = %source, "Address suppressed");
            added += 1;
        }
    }
    Ok(added)
}
