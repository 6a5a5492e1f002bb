//! Core
//!
//! Transport seam shared by the executor, the poller and token acquisition.

pub mod transport;

pub use transport::{
    create_mock_transport, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
    MockHttpTransport, ReqwestHttpTransport, DEFAULT_MAX_RESPONSE_SIZE,
};
