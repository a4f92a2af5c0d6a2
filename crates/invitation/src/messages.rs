//! Invitation handshake messages.

use serde::{Deserialize, Serialize};
use tessel_core::PublicKey;
use tessel_crypto::Signature;

const INTRO_DOMAIN: &[u8] = b"tessel.invitation.intro.v1";

/// Host's verdict on an auth code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStatus {
    Ok,
    InvalidCode,
    TooManyAttempts,
}

/// What the guest asks to be admitted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionRequest {
    /// A new device and the control feed it will write through
    Device {
        device_key: PublicKey,
        control_feed_key: PublicKey,
    },
    /// A new space member and its feed
    Space {
        member_key: PublicKey,
        feed_key: PublicKey,
    },
}

impl AdmissionRequest {
    /// The key being admitted.
    pub fn subject(&self) -> PublicKey {
        match self {
            AdmissionRequest::Device { device_key, .. } => *device_key,
            AdmissionRequest::Space { member_key, .. } => *member_key,
        }
    }
}

/// Coordinates handed to an admitted guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionResponse {
    Device {
        identity_key: PublicKey,
        halo_space_key: PublicKey,
        halo_genesis_feed_key: PublicKey,
    },
    Space {
        space_key: PublicKey,
        genesis_feed_key: PublicKey,
    },
}

/// Guest to host: `Introduce`, `Authenticate`, `Admit`.
/// Host to guest: `Introduction`, `AuthResult`, `Admitted`, `Rejected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationMessage {
    Introduce {
        invitation_id: PublicKey,
        guest_key: PublicKey,
        /// Signature by `guest_key` over the intro payload
        proof: Signature,
    },
    Introduction {
        auth_required: bool,
    },
    Authenticate {
        code: String,
    },
    AuthResult {
        status: AuthStatus,
    },
    Admit {
        request: AdmissionRequest,
    },
    Admitted {
        response: AdmissionResponse,
    },
    Rejected {
        reason: String,
    },
}

/// Bytes the guest signs to prove it holds `guest_key`.
pub fn intro_payload(invitation_id: &PublicKey, guest_key: &PublicKey) -> Vec<u8> {
    let mut buf = INTRO_DOMAIN.to_vec();
    buf.extend_from_slice(invitation_id.as_bytes());
    buf.extend_from_slice(guest_key.as_bytes());
    buf
}
