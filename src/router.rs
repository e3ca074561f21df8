use regex::RegexBuilder;
use serde::Deserialize;
use tracing::warn;

use crate::config::{FallbackConfig, RoutingConfig, StorageMode};
use crate::metadata::{FileMetadata, MirrorState};
use crate::provider::UploadFile;

/// Routing rules applied when none are configured
///
/// Small files ride the free relay; large media goes to the bucket.
const DEFAULT_RULES: &str = r#"[
    { "condition": "size < 5242880", "storage": "telegram" },
    { "condition": "type startsWith video/", "storage": "bucket" },
    { "condition": "type startsWith audio/", "storage": "bucket" },
    { "default": true, "storage": "bucket" }
]"#;

/// One declarative routing rule, as configured
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingRule {
    /// Condition expression; absent on the default rule
    pub condition: Option<String>,
    /// Target provider name
    pub storage: String,
    /// Matches unconditionally; order such a rule last
    #[serde(rename = "default", default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::Ge),
            "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            _ => None,
        }
    }

    fn eval(self, a: u64, b: u64) -> bool {
        match self {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
        }
    }
}

/// A condition compiled into a tagged predicate
///
/// The grammar is deliberately closed (no arbitrary expressions): numeric
/// compare on size, prefix/suffix on MIME type, case-insensitive regex on
/// name.
#[derive(Debug, Clone)]
enum Condition {
    Size(CmpOp, u64),
    TypeStartsWith(String),
    TypeEndsWith(String),
    NameMatches(regex::Regex),
}

impl Condition {
    /// Parse one condition; `None` for anything outside the grammar
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();

        if let Some(rest) = raw.strip_prefix("size") {
            let rest = rest.trim_start();
            // Two-char operators first so "<=" does not parse as "<"
            for op_str in ["<=", ">=", "==", "!=", "<", ">"] {
                if let Some(value) = rest.strip_prefix(op_str) {
                    let op = CmpOp::parse(op_str)?;
                    let value = value.trim().parse().ok()?;
                    return Some(Condition::Size(op, value));
                }
            }
            return None;
        }

        if let Some(rest) = raw.strip_prefix("type ") {
            let rest = rest.trim_start();
            if let Some(prefix) = rest.strip_prefix("startsWith ") {
                return Some(Condition::TypeStartsWith(prefix.trim().to_string()));
            }
            if let Some(suffix) = rest.strip_prefix("endsWith ") {
                return Some(Condition::TypeEndsWith(suffix.trim().to_string()));
            }
            return None;
        }

        if let Some(pattern) = raw.strip_prefix("name matches ") {
            let regex = RegexBuilder::new(pattern.trim())
                .case_insensitive(true)
                .build()
                .ok()?;
            return Some(Condition::NameMatches(regex));
        }

        None
    }

    fn matches(&self, file: &UploadFile) -> bool {
        match self {
            Condition::Size(op, value) => op.eval(file.size(), *value),
            Condition::TypeStartsWith(prefix) => file.content_type.starts_with(prefix.as_str()),
            Condition::TypeEndsWith(suffix) => file.content_type.ends_with(suffix.as_str()),
            Condition::NameMatches(regex) => regex.is_match(&file.file_name),
        }
    }
}

/// A rule with its condition compiled
///
/// Rules with unparseable conditions stay in the list but never match, so
/// files fall through to later rules instead of erroring.
#[derive(Debug, Clone)]
struct CompiledRule {
    condition: Option<Condition>,
    storage: String,
    is_default: bool,
}

impl CompiledRule {
    fn compile(rule: RoutingRule) -> Self {
        let condition = match &rule.condition {
            Some(raw) => {
                let parsed = Condition::parse(raw);
                if parsed.is_none() && !rule.is_default {
                    warn!(condition = %raw, "unparseable routing condition, rule will never match");
                }
                parsed
            }
            None => None,
        };

        Self {
            condition,
            storage: rule.storage,
            is_default: rule.is_default,
        }
    }

    fn matches(&self, file: &UploadFile) -> bool {
        self.condition.as_ref().is_some_and(|c| c.matches(file))
    }
}

/// Chooses the target backend for each upload and describes the mirror set
pub struct SmartRouter {
    mode: StorageMode,
    primary: Option<String>,
    provider: Option<String>,
    mirrors: String,
    mirror_async: bool,
    rules: Vec<CompiledRule>,
}

impl SmartRouter {
    pub fn new(routing: &RoutingConfig) -> Self {
        let rules = Self::parse_rules(routing.rules.as_deref());

        Self {
            mode: routing.mode,
            primary: routing.primary.clone(),
            provider: routing.provider.clone(),
            mirrors: routing.mirrors.clone(),
            mirror_async: routing.mirror_async,
            rules,
        }
    }

    fn parse_rules(configured: Option<&str>) -> Vec<CompiledRule> {
        let raw = configured.unwrap_or(DEFAULT_RULES);
        let rules: Vec<RoutingRule> = match serde_json::from_str(raw) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "failed to parse storage rules, using defaults");
                serde_json::from_str(DEFAULT_RULES).expect("default rules are valid")
            }
        };
        rules.into_iter().map(CompiledRule::compile).collect()
    }

    fn primary_name(&self) -> String {
        self.primary
            .clone()
            .or_else(|| self.provider.clone())
            .unwrap_or_else(|| "telegram".to_string())
    }

    /// Pick the provider name for an upload
    ///
    /// Single and redundant modes always use the configured primary;
    /// mirrors are a separate concern. Smart mode takes the first matching
    /// rule, with a `default` rule matching unconditionally.
    pub fn select_storage(&self, file: &UploadFile) -> String {
        if self.mode != StorageMode::Smart {
            return self.primary_name();
        }

        for rule in &self.rules {
            if rule.is_default || rule.matches(file) {
                return rule.storage.clone();
            }
        }

        self.primary_name()
    }

    /// Mirror provider names; empty outside redundant mode
    pub fn mirrors(&self) -> Vec<String> {
        if self.mode != StorageMode::Redundant {
            return Vec::new();
        }

        self.mirrors
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Whether mirror writes happen in the background
    pub fn is_async_mirror(&self) -> bool {
        self.mirror_async
    }
}

/// Ordered read candidates for a file
///
/// Primary first, then mirrors confirmed `synced` (pending and failed
/// copies are useless for reads), deduplicated; files without storage
/// metadata use the statically configured chain.
pub fn build_fallback_chain(fallback: &FallbackConfig, metadata: Option<&FileMetadata>) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();

    if let Some(storage) = metadata.and_then(|m| m.storage.as_ref()) {
        chain.push(storage.primary.to_string());
        for mirror in &storage.mirrors {
            let name = mirror.provider.to_string();
            if mirror.status == MirrorState::Synced && !chain.contains(&name) {
                chain.push(name);
            }
        }
    }

    if chain.is_empty() {
        chain = fallback
            .chain
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }

    chain
}
