/// Returns `Err($error)` early unless `$predicate` holds.
///
/// ```ignore
/// ensure!(state.head_sent, SendError::HeadNotSent);
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
