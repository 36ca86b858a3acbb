use http::{Response, StatusCode};

/// The head of a response, before a body is attached.
pub type ResponseHead = Response<()>;

/// Builds a bodyless head with the given status.
pub fn status_head(status: StatusCode) -> ResponseHead {
    let mut head = Response::new(());
    *head.status_mut() = status;
    head
}
