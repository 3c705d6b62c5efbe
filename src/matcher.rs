//! Request path matching.
//!
//! Route templates such as `/user/:id` or `/files/:path*` are compiled into
//! anchored, case-insensitive regexes. Matching walks the candidate routes in
//! record order and stops at the first hit.

use crate::error::{DecodeError, PatternError};
use crate::record::{MockRecord, RecordSet};
use regex::Regex;
use std::collections::BTreeMap;
use tracing::warn;

/// Pattern used for a parameter without an explicit group.
const DEFAULT_PARAM_PATTERN: &str = "[^/#?]+?";

/// Characters that become an optional prefix of the following parameter.
const PARAM_PREFIXES: &str = "./";

/// Parameters extracted from a matched path.
pub type Params = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Param {
        name: String,
        prefix: String,
        pattern: String,
        modifier: Option<char>,
    },
}

/// A compiled route template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    template: String,
    regex: Regex,
    keys: Vec<String>,
}

impl PathPattern {
    /// Compile a route template.
    pub fn compile(template: &str) -> Result<Self, PatternError> {
        let tokens = tokenize(template)?;
        let mut source = String::from("(?i)^");
        let mut keys = Vec::new();

        for token in &tokens {
            match token {
                Token::Literal(text) => source.push_str(&regex::escape(text)),
                Token::Param {
                    name,
                    prefix,
                    pattern,
                    modifier,
                } => {
                    let group = format!("p{}", keys.len());
                    keys.push(name.clone());
                    let prefix = regex::escape(prefix);
                    let repeated = matches!(modifier, Some('+') | Some('*'));
                    if !prefix.is_empty() {
                        if repeated {
                            let optional = if *modifier == Some('*') { "?" } else { "" };
                            source.push_str(&format!(
                                "(?:{prefix}(?P<{group}>(?:{pattern})(?:{prefix}(?:{pattern}))*)){optional}"
                            ));
                        } else {
                            let optional = modifier.map(String::from).unwrap_or_default();
                            source.push_str(&format!(
                                "(?:{prefix}(?P<{group}>{pattern})){optional}"
                            ));
                        }
                    } else {
                        let modifier = modifier.map(String::from).unwrap_or_default();
                        if repeated {
                            source.push_str(&format!("(?P<{group}>(?:{pattern}){modifier})"));
                        } else {
                            source.push_str(&format!("(?P<{group}>{pattern}){modifier}"));
                        }
                    }
                }
            }
        }

        // Non-strict: a trailing delimiter is tolerated
        source.push_str("[/#?]?$");

        let regex = Regex::new(&source).map_err(|e| PatternError::Regex {
            template: template.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            template: template.to_string(),
            regex,
            keys,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Parameter names in declaration order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Match a full request path.
    ///
    /// Returns `Ok(None)` when the path does not match and an error when a
    /// captured value is not valid percent-encoding.
    pub fn matches(&self, path: &str) -> Result<Option<Params>, DecodeError> {
        let Some(captures) = self.regex.captures(path) else {
            return Ok(None);
        };
        let mut params = Params::new();
        for (i, key) in self.keys.iter().enumerate() {
            if let Some(value) = captures.name(&format!("p{i}")) {
                params.insert(key.clone(), decode_param(value.as_str())?);
            }
        }
        Ok(Some(params))
    }
}

fn tokenize(template: &str) -> Result<Vec<Token>, PatternError> {
    let chars: Vec<char> = template.chars().collect();
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut unnamed = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '\\' if i + 1 < chars.len() => {
                literal.push(chars[i + 1]);
                i += 2;
            }
            ':' | '(' => {
                let start = i;
                let mut name = String::new();
                if ch == ':' {
                    i += 1;
                    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                        name.push(chars[i]);
                        i += 1;
                    }
                    if name.is_empty() {
                        return Err(PatternError::MissingName {
                            template: template.to_string(),
                            index: start,
                        });
                    }
                }

                let pattern = if i < chars.len() && chars[i] == '(' {
                    let (pattern, next) = read_group(template, &chars, i)?;
                    i = next;
                    pattern
                } else {
                    DEFAULT_PARAM_PATTERN.to_string()
                };

                if name.is_empty() {
                    name = unnamed.to_string();
                    unnamed += 1;
                }

                let modifier = match chars.get(i) {
                    Some(&m @ ('?' | '*' | '+')) => {
                        i += 1;
                        Some(m)
                    }
                    _ => None,
                };

                // The character right before a parameter becomes its prefix
                let mut prefix = String::new();
                if let Some(last) = literal.chars().last() {
                    if PARAM_PREFIXES.contains(last) {
                        literal.pop();
                        prefix.push(last);
                    }
                }
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Param {
                    name,
                    prefix,
                    pattern,
                    modifier,
                });
            }
            '?' | '*' | '+' => {
                return Err(PatternError::DanglingModifier {
                    template: template.to_string(),
                    index: i,
                    modifier: ch,
                });
            }
            _ => {
                literal.push(ch);
                i += 1;
            }
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

/// Read a `( ... )` group starting at `open`; returns its body and the index after `)`.
fn read_group(template: &str, chars: &[char], open: usize) -> Result<(String, usize), PatternError> {
    let mut depth = 1;
    let mut body = String::new();
    let mut i = open + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                body.push('\\');
                body.push(chars[i + 1]);
                i += 2;
                continue;
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    if body.is_empty() {
                        break;
                    }
                    return Ok((body, i + 1));
                }
            }
            _ => {}
        }
        body.push(chars[i]);
        i += 1;
    }
    Err(PatternError::UnterminatedGroup(template.to_string()))
}

/// Percent-decode a captured value.
///
/// Stricter than lenient URL decoders: a `%` that is not followed by two hex
/// digits, or escapes that do not form UTF-8, are errors.
pub fn decode_param(value: &str) -> Result<String, DecodeError> {
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(DecodeError {
                    value: value.to_string(),
                });
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| DecodeError {
            value: value.to_string(),
        })
}

/// Result of matching a request against the record set.
#[derive(Debug)]
pub struct MatchResult<'a> {
    /// The matched record
    pub record: &'a MockRecord,
    /// Decoded route parameters
    pub params: Params,
}

struct CompiledRoute {
    id: String,
    control: bool,
    pattern: Option<PathPattern>,
}

/// Compiled routes for one record set, in dispatch order.
///
/// User records come first in set order, followed by the control records
/// whose ids are not taken by a user record.
pub struct Matcher {
    routes: Vec<CompiledRoute>,
}

impl Matcher {
    /// Compile routes for a record set; `prefix` applies to user records only.
    pub fn new(records: &RecordSet, control: &[MockRecord], prefix: &str) -> Self {
        let user = records.iter().map(|record| CompiledRoute {
            id: record.id.clone(),
            control: false,
            pattern: compile_record(record, prefix),
        });
        let builtin = control
            .iter()
            .filter(|record| !records.contains(&record.id))
            .map(|record| CompiledRoute {
                id: record.id.clone(),
                control: true,
                pattern: compile_record(record, ""),
            });

        Self {
            routes: user.chain(builtin).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Find the first enabled record whose method and path match.
    pub fn find_match<'a>(
        &self,
        records: &'a RecordSet,
        control: &'a [MockRecord],
        method: &str,
        path: &str,
    ) -> Result<Option<MatchResult<'a>>, DecodeError> {
        for route in &self.routes {
            let Some(pattern) = &route.pattern else {
                continue;
            };
            let record = if route.control {
                control.iter().find(|r| r.id == route.id)
            } else {
                records.get(&route.id)
            };
            let Some(record) = record else {
                continue;
            };
            if !record.enable || !record.method.eq_ignore_ascii_case(method) {
                continue;
            }
            if let Some(params) = pattern.matches(path)? {
                return Ok(Some(MatchResult { record, params }));
            }
        }
        Ok(None)
    }
}

fn compile_record(record: &MockRecord, prefix: &str) -> Option<PathPattern> {
    if !record.is_routable() {
        return None;
    }
    let path = record.path.as_deref()?;
    let template = if record.is_control() || prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}{path}")
    };
    match PathPattern::compile(&template) {
        Ok(pattern) => Some(pattern),
        Err(e) => {
            warn!(id = %record.id, error = %e, "Mock route cannot be compiled, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{control_records, ControlEndpoint};
    use crate::record::Handler;
    use serde_json::json;

    fn make_record(key: &str) -> MockRecord {
        MockRecord::from_export(key, Handler::Static(json!({})), None, None)
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_literal_path() {
        let pattern = PathPattern::compile("/api/users").unwrap();
        assert_eq!(pattern.matches("/api/users").unwrap(), Some(Params::new()));
        assert_eq!(pattern.matches("/api/users/").unwrap(), Some(Params::new()));
        assert_eq!(pattern.matches("/API/Users").unwrap(), Some(Params::new()));
        assert_eq!(pattern.matches("/api/users/1").unwrap(), None);
        assert_eq!(pattern.matches("/v1/api/users").unwrap(), None);
    }

    #[test]
    fn test_named_params() {
        let pattern = PathPattern::compile("/user/:id/posts/:postId").unwrap();
        assert_eq!(pattern.keys(), ["id", "postId"]);
        assert_eq!(
            pattern.matches("/user/42/posts/7").unwrap(),
            Some(params(&[("id", "42"), ("postId", "7")]))
        );
        assert_eq!(pattern.matches("/user/42/posts").unwrap(), None);
        assert_eq!(pattern.matches("/user//posts/7").unwrap(), None);
    }

    #[test]
    fn test_param_is_decoded() {
        let pattern = PathPattern::compile("/search/:term").unwrap();
        assert_eq!(
            pattern.matches("/search/hello%20world").unwrap(),
            Some(params(&[("term", "hello world")]))
        );
        assert_eq!(
            pattern.matches("/search/caf%C3%A9").unwrap(),
            Some(params(&[("term", "café")]))
        );
    }

    #[test]
    fn test_malformed_escape_is_decode_error() {
        let pattern = PathPattern::compile("/search/:term").unwrap();
        let err = pattern.matches("/search/%E0%A4%A").unwrap_err();
        assert_eq!(err.value, "%E0%A4%A");
        assert!(pattern.matches("/search/%zz").is_err());
        assert!(pattern.matches("/search/%FF").is_err());
    }

    #[test]
    fn test_optional_param() {
        let pattern = PathPattern::compile("/list/:page?").unwrap();
        assert_eq!(pattern.matches("/list").unwrap(), Some(Params::new()));
        assert_eq!(
            pattern.matches("/list/3").unwrap(),
            Some(params(&[("page", "3")]))
        );
    }

    #[test]
    fn test_repeated_params() {
        let star = PathPattern::compile("/files/:path*").unwrap();
        assert_eq!(star.matches("/files").unwrap(), Some(Params::new()));
        assert_eq!(
            star.matches("/files/a/b/c").unwrap(),
            Some(params(&[("path", "a/b/c")]))
        );

        let plus = PathPattern::compile("/files/:path+").unwrap();
        assert_eq!(plus.matches("/files").unwrap(), None);
        assert_eq!(
            plus.matches("/files/a/b").unwrap(),
            Some(params(&[("path", "a/b")]))
        );
    }

    #[test]
    fn test_custom_and_unnamed_groups() {
        let pattern = PathPattern::compile("/user/:id(\\d+)").unwrap();
        assert_eq!(
            pattern.matches("/user/42").unwrap(),
            Some(params(&[("id", "42")]))
        );
        assert_eq!(pattern.matches("/user/abc").unwrap(), None);

        let unnamed = PathPattern::compile("/icon-(\\d+).png").unwrap();
        assert_eq!(
            unnamed.matches("/icon-16.png").unwrap(),
            Some(params(&[("0", "16")]))
        );
    }

    #[test]
    fn test_invalid_templates() {
        assert!(matches!(
            PathPattern::compile("/user/:"),
            Err(PatternError::MissingName { .. })
        ));
        assert!(matches!(
            PathPattern::compile("/user/:id(\\d+"),
            Err(PatternError::UnterminatedGroup(_))
        ));
        assert!(matches!(
            PathPattern::compile("/a/*"),
            Err(PatternError::DanglingModifier { .. })
        ));
    }

    #[test]
    fn test_first_inserted_wins() {
        let records: RecordSet = vec![make_record("GET /user/:id"), make_record("GET /user/me")]
            .into_iter()
            .collect();
        let matcher = Matcher::new(&records, &[], "");

        let result = matcher
            .find_match(&records, &[], "GET", "/user/me")
            .unwrap()
            .unwrap();
        assert_eq!(result.record.id, "GET /user/:id");
        assert_eq!(result.params, params(&[("id", "me")]));
    }

    #[test]
    fn test_disabled_and_method_mismatch_never_match() {
        let mut disabled = make_record("GET /a");
        disabled.enable = false;
        let records: RecordSet = vec![disabled, make_record("POST /b")].into_iter().collect();
        let matcher = Matcher::new(&records, &[], "");

        assert!(matcher.find_match(&records, &[], "GET", "/a").unwrap().is_none());
        assert!(matcher.find_match(&records, &[], "GET", "/b").unwrap().is_none());
        assert!(matcher.find_match(&records, &[], "post", "/b").unwrap().is_some());
    }

    #[test]
    fn test_prefix_skips_control_routes() {
        let records: RecordSet = vec![make_record("GET /user/:id")].into_iter().collect();
        let control = control_records("/_mock");
        let matcher = Matcher::new(&records, &control, "/api");

        assert!(matcher
            .find_match(&records, &control, "GET", "/user/1")
            .unwrap()
            .is_none());
        let hit = matcher
            .find_match(&records, &control, "GET", "/api/user/1")
            .unwrap()
            .unwrap();
        assert_eq!(hit.record.id, "GET /user/:id");

        let hit = matcher
            .find_match(&records, &control, "GET", "/_mock/_getMock")
            .unwrap()
            .unwrap();
        assert!(matches!(
            hit.record.handler,
            Handler::Control(ControlEndpoint::GetMock)
        ));
    }

    #[test]
    fn test_user_record_shadows_control_id() {
        let records: RecordSet = vec![make_record("GET /_mock/_getMock")].into_iter().collect();
        let control = control_records("/_mock");
        let matcher = Matcher::new(&records, &control, "");
        assert_eq!(matcher.len(), 3);

        let hit = matcher
            .find_match(&records, &control, "GET", "/_mock/_getMock")
            .unwrap()
            .unwrap();
        assert!(!hit.record.is_control());
    }

    #[test]
    fn test_inert_records_skipped() {
        let records: RecordSet = vec![make_record("FETCH /a"), make_record("GET /b/:")]
            .into_iter()
            .collect();
        let matcher = Matcher::new(&records, &[], "");
        assert!(matcher.find_match(&records, &[], "FETCH", "/a").unwrap().is_none());
        assert!(matcher.find_match(&records, &[], "GET", "/b/x").unwrap().is_none());
    }
}
