//! CDN-environment constants (spec §4.3, §4.5, §9's open question on the
//! "exact CDN-header signature"): the probe SNI, the header signature table
//! used to verify a sweep candidate is actually the CDN, and the primary /
//! mirror speed-test hosts. These are, per spec, environmental and only
//! overridable by recompiling.

/// Neutral SNI presented during sweep probes (spec §4.3: "SNI set to a
/// neutral name, e.g., the CDN's own trust anchor domain").
pub const PROBE_SNI: &str = "cloudflare.com";

/// `(header name, expected value prefix)`, matched case-insensitively on
/// the name. A sweep candidate is verified if any pair matches, or if
/// [`TRACE_HEADER_NAME`] is present at all.
pub const SIGNATURE_HEADERS: &[(&str, &str)] = &[("server", "cloudflare")];

/// Presence alone (any value) counts as verification, independent of
/// [`SIGNATURE_HEADERS`].
pub const TRACE_HEADER_NAME: &str = "cf-ray";

/// Primary CDN speed-test host and path prefix (spec §4.5). The full
/// request path is `{SPEED_PATH_PREFIX}{bytes}`.
pub const SPEED_HOST: &str = "speed.cloudflare.com";
pub const SPEED_PATH_PREFIX: &str = "/__down?bytes=";

/// Mirror host: identical path layout, no budget enforced by this program
/// (spec §4.6's failover target).
pub const MIRROR_SPEED_HOST: &str = "speed.mirror-cdn.example";
