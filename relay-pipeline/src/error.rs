//! Maps the component-specific error types the pipeline depends on
//! (`relay_store::StoreError`, `relay_knowledge::KnowledgeError`,
//! `relay_agent::LlmError`/`ExecutionError`) onto the workspace's unified
//! [`relay_common::error::Error`] taxonomy (spec §7), since none of those
//! crates can implement a foreign `From` for a foreign type.

pub use relay_common::error::{Error, Result};

pub fn from_store(e: relay_store::StoreError) -> Error {
    match e {
        relay_store::StoreError::NotFound(m) => Error::NotFound(m),
        relay_store::StoreError::Validation(m) => Error::Validation(m),
        relay_store::StoreError::Backend(m) => Error::Internal(m),
    }
}

pub fn from_knowledge(e: relay_knowledge::KnowledgeError) -> Error {
    let relay_knowledge::KnowledgeError::Backend(m) = e;
    Error::Internal(m)
}

pub fn from_llm(e: relay_agent::LlmError) -> Error {
    match e {
        relay_agent::LlmError::Timeout => Error::TransientUpstream("llm proxy timed out".into()),
        relay_agent::LlmError::Request(m) => Error::TransientUpstream(m),
        relay_agent::LlmError::Upstream { status, body } if status >= 500 => {
            Error::TransientUpstream(format!("llm proxy {status}: {body}"))
        }
        relay_agent::LlmError::Upstream { status, body } => Error::PermanentUpstream(format!("llm proxy {status}: {body}")),
    }
}

pub fn from_execution(e: relay_agent::ExecutionError) -> Error {
    match e {
        relay_agent::ExecutionError::Llm(inner) => from_llm(inner),
        relay_agent::ExecutionError::MaxTurnsExceeded(n) => Error::TransientUpstream(format!("tool loop exceeded {n} turns")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_not_found() {
        let e = from_store(relay_store::StoreError::NotFound("chat".into()));
        assert!(matches!(e, Error::NotFound(_)));
    }

    #[test]
    fn llm_5xx_is_transient() {
        let e = from_llm(relay_agent::LlmError::Upstream { status: 503, body: String::new() });
        assert!(matches!(e, Error::TransientUpstream(_)));
    }

    #[test]
    fn llm_4xx_is_permanent() {
        let e = from_llm(relay_agent::LlmError::Upstream { status: 400, body: String::new() });
        assert!(matches!(e, Error::PermanentUpstream(_)));
    }
}
