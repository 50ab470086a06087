// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Identity verification hook.
//!
//! Called once per connection, after the handshake is parsed and before the
//! user is registered. The relay ships with [`AcceptAnyIdentity`]: clients
//! are trusted to announce their own user id.

use crate::storage::UserId;

/// Decides whether a connection may register as `user_id`.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, user_id: UserId) -> bool;
}

/// Accepts every claimed identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyIdentity;

impl IdentityVerifier for AcceptAnyIdentity {
    fn verify(&self, _user_id: UserId) -> bool {
        true
    }
}

impl<F> IdentityVerifier for F
where
    F: Fn(UserId) -> bool + Send + Sync,
{
    fn verify(&self, user_id: UserId) -> bool {
        self(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_any_identity() {
        let verifier = AcceptAnyIdentity;
        assert!(verifier.verify(1));
        assert!(verifier.verify(-5));
        assert!(verifier.verify(i64::MAX));
    }

    #[test]
    fn test_closure_verifier() {
        let verifier = |id: UserId| id > 0;
        assert!(verifier.verify(3));
        assert!(!IdentityVerifier::verify(&verifier, 0));
    }
}
