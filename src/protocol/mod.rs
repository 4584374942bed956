//! Protocol payloads of a mock and the request/response shapes exchanged with
//! the transports.

pub mod graphql;
pub mod grpc;
pub mod http;
pub mod mqtt;
pub mod oauth;
pub mod soap;
pub mod websocket;

pub use graphql::{GraphqlOutcome, GraphqlRequest, GraphqlSpec, ResolverConfig};
pub use grpc::{GrpcCode, GrpcReply, GrpcSpec, MethodConfig, ServiceConfig};
pub use http::{HttpAction, HttpMatcher, HttpRequest, HttpResponse, HttpSpec, PathRule};
pub use mqtt::{MqttPublisher, MqttSpec, PublishSchedule, TopicConfig};
pub use oauth::{
    OAuthSpec, RefreshClaims, TokenIssuer, TokenRequest, TokenResponse, UnsignedTokenIssuer,
};
pub use soap::{SoapFault, SoapOperation, SoapOutcome, SoapRequest, SoapSpec};
pub use websocket::{WebSocketSpec, WsReply};
