//! Pulumi Cloud integration: REST client, API types and the stack-to-entity
//! transformer.

pub mod client;
pub mod transformer;
pub mod types;

pub use client::{PULUMI_ACCEPT_HEADER, PulumiClient, PulumiClientError, parse_base_url};
pub use transformer::{
    DefaultResourceTransformer, ResourceTransformer, TransformError, filter_tags,
};
pub use types::{AccessToken, PulumiProviderConfig, StackDetail, StackSummary, StacksPage};
