//! Default values for configuration

/// Default listen address for the webhook server
pub fn default_bind_addr() -> String {
    std::env::var("LEADLINE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
}

/// Default tolerance for the optional webhook timestamp header (5 minutes)
pub fn default_timestamp_tolerance_secs() -> i64 {
    300
}

/// Default maximum webhook body size (1 MB)
pub fn default_max_body_bytes() -> usize {
    1024 * 1024
}

/// Default SQLite pool size
pub fn default_db_max_connections() -> u32 {
    5
}

/// Default call-provider API base URL
pub fn default_provider_base_url() -> String {
    std::env::var("LEADLINE_PROVIDER_URL")
        .unwrap_or_else(|_| "https://api.calltrackingmetrics.com/api/v1".to_string())
}

/// Default outbound request timeout in seconds
pub fn default_http_timeout() -> u64 {
    30
}

/// Default transcription backend URL
pub fn default_transcription_url() -> String {
    std::env::var("LEADLINE_TRANSCRIPTION_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:7998".to_string())
}

/// Default environment variable holding the transcription API key
pub fn default_transcription_api_key_env() -> String {
    "LEADLINE_TRANSCRIPTION_API_KEY".to_string()
}

/// Default transcription language
pub fn default_language_code() -> String {
    "en-US".to_string()
}

/// Default audio sample rate (phone audio)
pub fn default_sample_rate_hertz() -> u32 {
    8000
}

/// Default audio encoding
pub fn default_audio_encoding() -> String {
    "MP3".to_string()
}

/// Default minimum expected speakers
pub fn default_min_speakers() -> u32 {
    2
}

/// Default maximum expected speakers
pub fn default_max_speakers() -> u32 {
    4
}

/// Default content-analysis backend URL
pub fn default_analysis_url() -> String {
    std::env::var("LEADLINE_ANALYSIS_URL").unwrap_or_else(|_| "http://127.0.0.1:7999".to_string())
}

/// Default environment variable holding the analysis API key
pub fn default_analysis_api_key_env() -> String {
    "LEADLINE_ANALYSIS_API_KEY".to_string()
}

/// Default analysis model
pub fn default_analysis_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Default sampling temperature for lead analysis
pub fn default_analysis_temperature() -> f32 {
    0.2
}

/// Default token budget for lead analysis
pub fn default_analysis_max_tokens() -> u32 {
    800
}

/// Default token budget for the spam score
pub fn default_spam_max_tokens() -> u32 {
    16
}

/// Default extra attempts after an unparseable model response
pub fn default_parse_retries() -> u32 {
    2
}

/// Default call-provider requests per window (publisher ceiling)
pub fn default_provider_requests_per_window() -> u32 {
    60
}

/// Default requests per window for transcription/analysis/CRM
pub fn default_services_requests_per_window() -> u32 {
    120
}

/// Default token refill window in seconds
pub fn default_window_secs() -> u64 {
    60
}

/// Default maximum concurrent outbound calls per client
pub fn default_max_in_flight() -> usize {
    16
}

/// Default attempts for transient failures
pub fn default_retry_max_attempts() -> u32 {
    4
}

/// Default first backoff delay in milliseconds
pub fn default_retry_base_delay_ms() -> u64 {
    500
}

/// Default backoff cap in milliseconds
pub fn default_retry_max_delay_ms() -> u64 {
    30_000
}

/// Default first delay when a resource is not yet available (1 minute)
pub fn default_unavailable_delay_secs() -> u64 {
    60
}

/// Default attempts while a resource is not yet available
pub fn default_unavailable_max_attempts() -> u32 {
    5
}

/// Default wall-clock ceiling before a request is failed for review (1 hour)
pub fn default_max_retry_window_secs() -> u64 {
    3600
}

/// Default age before an enrichment or sync claim is treated as abandoned (15 minutes)
pub fn default_claim_timeout_secs() -> u64 {
    900
}

/// Default consecutive CRM failures before an integration is degraded
pub fn default_crm_degraded_threshold() -> u32 {
    5
}

/// Default HubSpot API base URL
pub fn default_hubspot_base_url() -> String {
    "https://api.hubapi.com".to_string()
}
