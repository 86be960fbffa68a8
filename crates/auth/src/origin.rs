//! Anonymous origin fingerprint for views and downloads.
//!
//! Best effort only: clients behind the same proxy share a key, and a client
//! that forges `X-Forwarded-For` can mint new keys at will.

use std::net::IpAddr;

use glyphmart_core::ActorKey;

/// Derive the ledger key for an anonymous caller.
///
/// Uses the first entry of `X-Forwarded-For` when present and well formed,
/// otherwise the transport peer address, otherwise `"unknown"`.
pub fn fingerprint(forwarded_for: Option<&str>, peer: Option<IpAddr>) -> ActorKey {
    let forwarded = forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .and_then(|first| ActorKey::anonymous(first).ok());

    if let Some(key) = forwarded {
        return key;
    }

    peer.and_then(|ip| ActorKey::anonymous(&ip.to_string()).ok())
        .unwrap_or_else(ActorKey::unknown)
}
