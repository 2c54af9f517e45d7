use std::any::Any;

/// Turn a panic payload caught from a handler into a reportable error.
pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    anyhow::anyhow!("handler panicked: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_str_and_string_payloads() {
        let error = panic_error(Box::new("boom"));
        assert_eq!(error.to_string(), "handler panicked: boom");

        let error = panic_error(Box::new(String::from("kaboom")));
        assert_eq!(error.to_string(), "handler panicked: kaboom");
    }

    #[test]
    fn tolerates_other_payloads() {
        let error = panic_error(Box::new(42_u8));
        assert_eq!(error.to_string(), "handler panicked: non-string panic payload");
    }
}
