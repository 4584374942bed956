//! Polymock
//!
//! A multi-protocol mock server engine. Mocks for HTTP (including SSE and
//! stateful CRUD), WebSocket, GraphQL, gRPC, MQTT, SOAP and OAuth live in one
//! registry; transports decode their wire format and ask [`MockEngine`] what
//! to answer.
//!
//! # Features
//!
//! - **Request Matching**: method, exact path or regex pattern, headers, query params, body
//! - **Priorities**: higher priority wins, then the more specific mock, then the earlier one
//! - **Dynamic Templates**: Handlebars templates with request data and path captures
//! - **Server-Sent Events**: fixed lists, repeated templates and numeric sequences
//! - **Stateful Resources**: in-memory CRUD tables wired to HTTP and SOAP operations
//! - **Endpoint Merging**: gRPC, MQTT and SOAP definitions on a shared port or path compose
//!
//! # Example Configuration
//!
//! ```yaml
//! version: "1.0"
//! mocks:
//!   - id: hello-world
//!     type: http
//!     http:
//!       matcher:
//!         method: GET
//!         path: /hello
//!       response:
//!         statusCode: 200
//!         body: '{"message": "Hello, World!"}'
//! statefulResources:
//!   - name: users
//!     basePath: /api/users
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod merge;
pub mod protocol;
pub mod resolver;
pub mod sse;
pub mod stateful;
pub mod store;
pub mod template;

pub use config::{EngineConfig, EngineSettings, Mock, MockCollection, MockSpec, MockType};
pub use engine::{EngineStats, HttpOutcome, ImportSummary, MockEngine, TokenOutcome};
pub use error::{EngineError, StatefulError, ValidationError};
pub use merge::{CreateOptions, CreateOutcome, MergeAction, MergeDetails};
pub use resolver::HttpReply;
pub use sse::{SseConfig, SseFrame, SseStream};
pub use stateful::{StatefulBinding, StatefulResourceConfig};
