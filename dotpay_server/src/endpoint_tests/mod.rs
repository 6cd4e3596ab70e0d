mod helpers;
mod mocks;

mod auth;
mod initiate;
mod quotes;
mod reconcile;
mod webhooks;
