//! Credential processor: transitive trust rooted at a single key.
//!
//! The processor accepts a credential iff its signature verifies and its
//! issuer is already trusted. The root key is trusted from the start;
//! accepted `AuthorizedDevice` and `SpaceMember` credentials extend trust to
//! their subjects. Credentials whose issuer is not yet trusted are held and
//! re-evaluated after every acceptance until no held credential can be
//! accepted (a fixed point), because replication delivers entries from
//! different feeds in no particular relative order.

use crate::credential::{Assertion, Credential};
use std::collections::{BTreeSet, HashSet};
use tessel_core::PublicKey;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outcome of offering one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Applied to the authorization state
    Accepted,
    /// Issuer not yet trusted; held for re-evaluation
    Held,
    /// Same subject and assertion already seen
    Duplicate,
    /// Bad signature or unrelated to this root; dropped
    Rejected,
}

/// Change to the authorization state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationEvent {
    DeviceAuthorized {
        device_key: PublicKey,
        issuer: PublicKey,
    },
    FeedAdmitted {
        feed_key: PublicKey,
        issuer: PublicKey,
    },
    MemberAdmitted {
        member_key: PublicKey,
        issuer: PublicKey,
    },
}

/// Snapshot of what the processor has accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationState {
    /// Devices authorized under the root identity
    pub devices: BTreeSet<PublicKey>,
    /// Members admitted into the root space
    pub members: BTreeSet<PublicKey>,
    /// Feeds admitted into the scope space
    pub feeds: BTreeSet<PublicKey>,
    /// Number of accepted credentials
    pub credentials: usize,
    /// Number of credentials held waiting for a trusted issuer
    pub held: usize,
}

impl AuthorizationState {
    /// True if `device_key` has been authorized.
    pub fn is_device_authorized(&self, device_key: &PublicKey) -> bool {
        self.devices.contains(device_key)
    }

    /// True if `feed_key` has been admitted.
    pub fn is_feed_admitted(&self, feed_key: &PublicKey) -> bool {
        self.feeds.contains(feed_key)
    }

    /// True if `member_key` has been admitted.
    pub fn is_member(&self, member_key: &PublicKey) -> bool {
        self.members.contains(member_key)
    }
}

/// Applies credentials for one trust root.
///
/// `root` anchors trust (the identity key for a HALO, the space key for a
/// space). `scope` is the space key feed and member assertions must name.
pub struct CredentialProcessor {
    root: PublicKey,
    scope: PublicKey,
    trusted: HashSet<PublicKey>,
    seen: HashSet<(PublicKey, Assertion)>,
    held: Vec<Credential>,
    state: watch::Sender<AuthorizationState>,
    events: broadcast::Sender<AuthorizationEvent>,
}

impl std::fmt::Debug for CredentialProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProcessor")
            .field("root", &self.root)
            .field("scope", &self.scope)
            .field("trusted", &self.trusted.len())
            .field("held", &self.held.len())
            .finish()
    }
}

impl CredentialProcessor {
    /// Processor trusting only `root`.
    pub fn new(root: PublicKey, scope: PublicKey) -> Self {
        let (state, _) = watch::channel(AuthorizationState::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            root,
            scope,
            trusted: HashSet::from([root]),
            seen: HashSet::new(),
            held: Vec::new(),
            state,
            events,
        }
    }

    /// Trust anchor.
    pub fn root(&self) -> PublicKey {
        self.root
    }

    /// Space key that feed and member assertions must name.
    pub fn scope(&self) -> PublicKey {
        self.scope
    }

    /// True if `key` may issue credentials.
    pub fn is_trusted(&self, key: &PublicKey) -> bool {
        self.trusted.contains(key)
    }

    /// Current authorization snapshot.
    pub fn state(&self) -> AuthorizationState {
        self.state.borrow().clone()
    }

    /// Watch the authorization state.
    pub fn subscribe_state(&self) -> watch::Receiver<AuthorizationState> {
        self.state.subscribe()
    }

    /// Receive an event per accepted credential.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AuthorizationEvent> {
        self.events.subscribe()
    }

    /// Offer a credential.
    pub fn process(&mut self, credential: Credential) -> ProcessOutcome {
        if !credential.verify() {
            warn!(
                issuer = %credential.issuer.fmt_short(),
                subject = %credential.subject.fmt_short(),
                "Dropping credential with invalid signature"
            );
            return ProcessOutcome::Rejected;
        }
        if !self.in_scope(&credential.assertion) {
            debug!(
                issuer = %credential.issuer.fmt_short(),
                "Ignoring credential for another root"
            );
            return ProcessOutcome::Rejected;
        }

        let fingerprint = (credential.subject, credential.assertion.clone());
        if self.seen.contains(&fingerprint) || self.held.contains(&credential) {
            return ProcessOutcome::Duplicate;
        }

        if !self.is_trusted(&credential.issuer) {
            trace!(issuer = %credential.issuer.fmt_short(), "Holding credential from untrusted issuer");
            self.held.push(credential);
            self.publish_held();
            return ProcessOutcome::Held;
        }

        self.apply(credential);
        self.reevaluate();
        ProcessOutcome::Accepted
    }

    fn in_scope(&self, assertion: &Assertion) -> bool {
        match assertion {
            Assertion::AuthorizedDevice { identity_key, .. } => *identity_key == self.root,
            Assertion::AuthorizedFeed { space_key, .. } => *space_key == self.scope,
            Assertion::SpaceMember { space_key, .. } => *space_key == self.scope,
        }
    }

    fn apply(&mut self, credential: Credential) {
        let issuer = credential.issuer;
        let event = match credential.assertion.clone() {
            Assertion::AuthorizedDevice { device_key, .. } => {
                self.trusted.insert(device_key);
                self.state.send_modify(|s| {
                    s.devices.insert(device_key);
                });
                AuthorizationEvent::DeviceAuthorized { device_key, issuer }
            }
            Assertion::AuthorizedFeed { feed_key, .. } => {
                self.state.send_modify(|s| {
                    s.feeds.insert(feed_key);
                });
                AuthorizationEvent::FeedAdmitted { feed_key, issuer }
            }
            Assertion::SpaceMember { member_key, .. } => {
                self.trusted.insert(member_key);
                self.state.send_modify(|s| {
                    s.members.insert(member_key);
                });
                AuthorizationEvent::MemberAdmitted { member_key, issuer }
            }
        };
        debug!(?event, "Credential accepted");
        self.seen.insert((credential.subject, credential.assertion));
        self.state.send_modify(|s| s.credentials += 1);
        let _ = self.events.send(event);
    }

    /// Accept held credentials until nothing more can be accepted.
    fn reevaluate(&mut self) {
        loop {
            let Some(index) = self
                .held
                .iter()
                .position(|c| self.trusted.contains(&c.issuer))
            else {
                break;
            };
            let credential = self.held.swap_remove(index);
            if !self
                .seen
                .contains(&(credential.subject, credential.assertion.clone()))
            {
                self.apply(credential);
            }
        }
        self.publish_held();
    }

    fn publish_held(&self) {
        let held = self.held.len();
        self.state.send_if_modified(|s| {
            let changed = s.held != held;
            s.held = held;
            changed
        });
    }
}
