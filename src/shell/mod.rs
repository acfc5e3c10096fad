// Composition root for the saga step outcome service.
//
// Responsibilities
// - Read config from environment.
// - Pick the broker connector (Kafka when built with the `kafka` feature).
// - Wire factory, pool and publisher into the report handler.
// - Serve the HTTP inbound adapter and drain the pool on shutdown.

pub mod http;
pub mod state;
