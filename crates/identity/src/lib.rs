//! Identities, devices and spaces built on signed control feeds.
//!
//! Authorization is expressed as [`Credential`]s appended to feeds. A
//! [`ControlPipeline`] reads every admitted feed of a space, verifies each
//! credential and folds it into an [`AuthorizationState`]. Nothing here
//! trusts the transport: a credential counts only when its signature checks
//! out and its issuer is already trusted, directly or through a chain back
//! to the root key.
//!
//! # Core Concepts
//!
//! - **Identity**: a long-lived key that vouches for the devices of one user
//! - **HALO**: the identity's private control space; the identity's devices
//!   are its members and each writes through its own control feed
//! - **Space**: a shared collection of feeds rooted at the space key
//!
//! # Trust Model
//!
//! - The root key (identity or space key) is trusted from the start
//! - An accepted `AuthorizedDevice` or `SpaceMember` credential makes its
//!   subject trusted
//! - Credentials from untrusted issuers are held and re-evaluated whenever
//!   trust grows, so arrival order across feeds does not matter

pub mod credential;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod processor;
pub mod space;

pub use credential::{Assertion, Credential, FeedMessage};
pub use error::{IdentityError, IdentityResult};
pub use manager::{IdentityManager, IdentityState, JoinParams};
pub use pipeline::ControlPipeline;
pub use processor::{AuthorizationEvent, AuthorizationState, CredentialProcessor, ProcessOutcome};
pub use space::Space;
