//! Exchange plumbing shared by the master listeners and the follower
//! command clients: request signing, wire types and the REST client.

pub mod auth;
pub mod client;
pub mod types;

pub use auth::{AuthError, ExchangeSigner, SignedRequest};
pub use client::{
    http_client, ClientError, ClientFactory, ExchangeClient, RestClientFactory,
    RestExchangeClient,
};
