//! # SRT Core
//!
//! Core business logic for the specimen request tracking engine.
//!
//! This crate contains the whole request lifecycle, independent of any web
//! surface:
//! - Request status and actor registries with administrator ordering
//! - The requestability rule engine deciding which vials may be requested
//! - Per-request requirement checklists seeded from default templates
//! - The request aggregate: shopping cart, submission, vial-set invariants
//! - Notification recipient resolution for request events
//!
//! **No API concerns**: HTTP or gRPC servers, HTML rendering and
//! authentication belong to the host application; it supplies capability
//! flags, the specimen repository and the mail transport, and drives this
//! crate through the service types re-exported below.

pub mod actors;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod notifications;
pub mod requests;
pub mod requirements;
pub mod rules;
pub mod specimens;
pub mod statuses;
pub mod store;

pub use actors::ActorRegistry;
pub use config::CoreConfig;
pub use error::{RequestError, RequestResult};
pub use events::{RequestEvent, RequestEventType};
pub use model::{
    Actor, ActorId, ActorScope, ContainerId, EventId, Request, RequestId, Requirement,
    RequirementId, RequirementKind, RequirementOwner, Site, SiteId, Status, StatusId, User, UserId,
};
pub use notifications::{notify, MailTransport, NotificationResolver, RecipientSet};
pub use requests::RequestService;
pub use requirements::RequirementEngine;
pub use rules::{
    default_rules, evaluate, CustomQueryRule, RequestableRule, RuleContext, RuleRegistry, RuleSet,
    Verdict,
};
pub use specimens::{InMemorySpecimenVault, SpecimenRepository, Vial};
pub use statuses::{StatusRegistry, StatusUpdate};
pub use store::StudyStore;
