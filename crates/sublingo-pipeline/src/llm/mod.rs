//! LLM access: protocol negotiation, the JSON client, the access probe,
//! and usage accumulation.

pub mod client;
pub mod probe;
pub mod protocol;
pub mod usage;

pub use client::{LLM_REQUEST_TIMEOUT, LlmClient, extract_json_from_text, extract_responses_output_text};
pub use probe::{PROBE_TTL, ProbeCache, probe_cache_key, probe_llm_access};
pub use protocol::{
    LlmProtocol, infer_llm_provider, infer_protocol_candidates, normalize_llm_base_url,
    should_fallback_protocol,
};
pub use usage::{LlmUsageSnapshot, UsageCollector, extract_usage_from_payload};
