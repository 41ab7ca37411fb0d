//! ActivityPub federation module
//!
//! Handles:
//! - Actor key pair management
//! - HTTP Signatures
//! - WebFinger
//! - Remote actor resolution
//! - Capability discovery (NodeInfo)
//! - Activity delivery and the retry queue

mod actor;
mod capability;
mod delivery;
mod keys;
mod queue;
mod signature;
mod webfinger;

pub use actor::{ActorResolver, extract_actor_domain};
pub use capability::{CAP_ENCRYPTED_DM, CapabilityDiscovery, EncryptionSupport};
pub use delivery::{
    ActivityDelivery, DeliverySubmission, DirectMessageResult, builder,
};
pub use keys::{GeneratedKeyPair, ensure_actor_keypair, generate_keypair};
pub use queue::{
    AttemptOutcome, DeliveryJob, DeliveryQueue, DeliveryWorker, LocalDeliveryQueue, RetryPolicy,
};
pub use signature::{
    ParsedSignature, SignatureHeaders, extract_signature_key_id, generate_digest,
    key_id_matches_actor, parse_signature_header, sign_request, verify_signature,
};
pub use webfinger::{
    Handle, WebFingerLink, WebFingerResponse, create_local_response, extract_actor_url,
    local_actor_url, parse_acct_uri, parse_handle, query_remote,
};
