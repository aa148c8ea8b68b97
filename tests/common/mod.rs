//! Shared helpers for the integration test binaries.
