// Service-level tests against the in-memory store and fake collaborators

mod preflight;
mod scanner;
