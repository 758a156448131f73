//! Engine configuration.
//!
//! Populated by the `Sec*` configuration directives before `init`, read-only
//! afterwards. Defaults follow the language's documented defaults.

use crate::seclang::ConfigSetting;

/// Global evaluation mode (`SecRuleEngine`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleEngineMode {
    On,
    Off,
    /// Evaluate everything, suppress disruptive dispositions.
    DetectionOnly,
}

impl RuleEngineMode {
    pub fn parse(text: &str) -> Option<RuleEngineMode> {
        match text.to_ascii_lowercase().as_str() {
            "on" => Some(RuleEngineMode::On),
            "off" => Some(RuleEngineMode::Off),
            "detectiononly" => Some(RuleEngineMode::DetectionOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: RuleEngineMode,
    pub request_body_access: bool,
    pub response_body_access: bool,
    pub request_body_limit: usize,
    pub response_body_limit: usize,
    pub argument_separator: char,
    pub pcre_match_limit: u64,
    pub pcre_match_limit_recursion: u64,
    pub unicode_map_file: Option<String>,
    /// Response content types whose bodies are inspected in phase 4.
    pub response_body_mime_types: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            mode: RuleEngineMode::On,
            request_body_access: false,
            response_body_access: false,
            request_body_limit: 13_107_200,
            response_body_limit: 524_288,
            argument_separator: '&',
            pcre_match_limit: 1500,
            pcre_match_limit_recursion: 1500,
            unicode_map_file: None,
            response_body_mime_types: vec!["text/plain".to_string(), "text/html".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn apply(&mut self, setting: ConfigSetting) {
        match setting {
            ConfigSetting::RuleEngine(mode) => self.mode = mode,
            ConfigSetting::RequestBodyAccess(enabled) => self.request_body_access = enabled,
            ConfigSetting::ResponseBodyAccess(enabled) => self.response_body_access = enabled,
            ConfigSetting::RequestBodyLimit(limit) => self.request_body_limit = limit,
            ConfigSetting::ResponseBodyLimit(limit) => self.response_body_limit = limit,
            ConfigSetting::ArgumentSeparator(separator) => {
                self.argument_separator = separator;
            }
            ConfigSetting::PcreMatchLimit(limit) => self.pcre_match_limit = limit,
            ConfigSetting::PcreMatchLimitRecursion(limit) => {
                self.pcre_match_limit_recursion = limit;
            }
            ConfigSetting::UnicodeMapFile(path) => self.unicode_map_file = Some(path),
            ConfigSetting::ResponseBodyMimeTypes(types) => {
                self.response_body_mime_types = types;
            }
            ConfigSetting::Ignored => {}
        }
    }
}
