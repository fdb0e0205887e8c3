use std::any::Any;

/// Turn a payload caught by `catch_unwind` into an error we can record on
/// the failed job.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = panic.downcast_ref::<String>() {
        anyhow::anyhow!("job panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        anyhow::anyhow!("job panicked: {message}")
    } else {
        anyhow::anyhow!("job panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_string_payloads() {
        let panic: Box<dyn Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_message(&*panic).to_string(), "job panicked: boom");

        let panic: Box<dyn Any + Send> = Box::new("static boom");
        assert_eq!(
            panic_message(&*panic).to_string(),
            "job panicked: static boom"
        );
    }

    #[test]
    fn opaque_payloads_still_produce_an_error() {
        let panic: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(&*panic).to_string(), "job panicked");
    }
}
