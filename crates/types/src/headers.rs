//! Reserved `rb-*` envelope header keys (spec §6) and the `content-trust` enum.

use std::fmt;
use std::str::FromStr;

/// Reserved header key constants. Kept as a module (not a struct) so call
/// sites read as `headers::CONTENT_TRUST` — mirrors how the teacher keeps its
/// well-known config keys as bare `const`s rather than an enum.
pub mod headers {
    pub const CONTENT_TRUST: &str = "rb-content-trust";
    pub const TOOL_PROVIDER: &str = "rb-tool-provider";
    pub const TIMEOUT_MS: &str = "rb-timeout-ms";
    pub const SOURCE: &str = "rb-source";
    pub const DESTINATION: &str = "rb-destination";
    pub const RETRY_COUNT: &str = "rb-retry-count";
}

/// Value of the `rb-content-trust` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTrust {
    ToolRequest,
    ToolOutput,
}

impl fmt::Display for ContentTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentTrust::ToolRequest => "tool-request",
            ContentTrust::ToolOutput => "tool-output",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ContentTrust {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool-request" => Ok(ContentTrust::ToolRequest),
            "tool-output" => Ok(ContentTrust::ToolOutput),
            other => Err(format!("unknown content-trust value: {other}")),
        }
    }
}
