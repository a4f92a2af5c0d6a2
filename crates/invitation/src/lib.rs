//! Tessel Invitations
//!
//! Admits new devices into an identity and new members into a space.
//!
//! # Flow
//!
//! 1. The host creates an invitation and hands the encoded
//!    [`InvitationDescriptor`] to the guest out of band. Interactive
//!    invitations also show an auth code.
//! 2. Both sides join the swarm named in the descriptor.
//! 3. The guest introduces itself with a signature over the invitation id,
//!    then presents auth codes until one is accepted.
//! 4. The guest asks for admission; the host writes the admitting
//!    credential and replies with the keys the guest needs to replicate.
//!
//! Offline invitations skip step 3: the descriptor names the only key that
//! may be admitted, and the guest proves it holds it.

pub mod descriptor;
pub mod error;
pub mod handler;
pub mod messages;
pub mod protocol;

pub use descriptor::{InvitationDescriptor, InvitationKind, InvitationTarget};
pub use error::{InvitationError, InvitationResult};
pub use handler::{HostInvitation, InvitationOptions, InvitationState, InvitationsHandler};
pub use messages::{AdmissionRequest, AdmissionResponse, AuthStatus, InvitationMessage};
pub use protocol::{
    DeviceInvitationProtocol, InvitationGuest, InvitationHost, InvitationKeys,
    SpaceInvitationProtocol,
};
