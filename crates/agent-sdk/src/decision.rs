//! Decisions returned by policy callbacks.
//!
//! The wire carries a closed union: the bare string `"allow"`, an object
//! keyed by `block`/`redirect`/`challenge`, or the sentinel
//! `{"needs_more": true}` for "send me more chunks before I decide".
//! [`Decision`] is the fluent builder agents construct; the handler turns it
//! into a [`DecisionMessage`] keyed by the request it answers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The verdict part of a decision, serialized exactly as the wire expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Pass the request/response through
    Allow,
    /// Reject with a synthesized response
    Block {
        status: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
    /// Redirect the client
    Redirect { url: String, status: u16 },
    /// Challenge the client (e.g. CAPTCHA)
    Challenge {
        challenge_type: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        params: HashMap<String, String>,
    },
    /// Provisional: more body chunks are needed before a final verdict
    NeedsMore(bool),
}

impl Verdict {
    /// True for verdicts that finish the request on the proxy side.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Verdict::Block { .. } | Verdict::Redirect { .. } | Verdict::Challenge { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::NeedsMore(_))
    }
}

/// Header modification operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum HeaderOp {
    /// Set a header (replace if it exists)
    Set { name: String, value: String },
    /// Add a header (append if it exists)
    Add { name: String, value: String },
    /// Remove a header
    Remove { name: String },
}

/// Audit metadata attached to a decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditMetadata {
    /// Tags for logging/metrics
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Rule IDs that matched
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rule_ids: Vec<String>,
    /// Confidence score (0.0 - 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Reason codes
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reason_codes: Vec<String>,
    /// Custom metadata
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, serde_json::Value>,
}

impl AuditMetadata {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.rule_ids.is_empty()
            && self.confidence.is_none()
            && self.reason_codes.is_empty()
            && self.custom.is_empty()
    }
}

/// Decision frame payload (0x20), correlated by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionMessage {
    pub request_id: u64,
    pub decision: Verdict,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_headers: Vec<HeaderOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_headers: Vec<HeaderOp>,
    #[serde(default, skip_serializing_if = "AuditMetadata::is_empty")]
    pub audit: AuditMetadata,
}

impl DecisionMessage {
    /// Bare allow, used as the defensive reply.
    pub fn allow(request_id: u64) -> Self {
        Self {
            request_id,
            decision: Verdict::Allow,
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            audit: AuditMetadata::default(),
        }
    }

    /// Provisional reply for a non-final body chunk.
    pub fn needs_more(request_id: u64) -> Self {
        Self {
            request_id,
            decision: Verdict::NeedsMore(true),
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            audit: AuditMetadata::default(),
        }
    }
}

/// Fluent builder for policy decisions.
///
/// ```
/// use zentinel_agent_sdk::Decision;
///
/// let decision = Decision::deny()
///     .with_body("Forbidden path")
///     .with_tag("denylist")
///     .with_reason_code("PATH_BLOCKED");
/// assert!(!decision.is_allow());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    verdict: Verdict,
    request_headers: Vec<HeaderOp>,
    response_headers: Vec<HeaderOp>,
    audit: AuditMetadata,
}

impl Default for Decision {
    fn default() -> Self {
        Self::allow()
    }
}

impl Decision {
    /// Pass the request through.
    pub fn allow() -> Self {
        Self {
            verdict: Verdict::Allow,
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            audit: AuditMetadata::default(),
        }
    }

    /// Block with the given status.
    pub fn block(status: u16) -> Self {
        Self {
            verdict: Verdict::Block {
                status,
                body: None,
                headers: None,
            },
            ..Self::allow()
        }
    }

    /// Block with 403.
    pub fn deny() -> Self {
        Self::block(403)
    }

    /// Block with 401.
    pub fn unauthorized() -> Self {
        Self::block(401)
    }

    /// Block with 429.
    pub fn rate_limited() -> Self {
        Self::block(429)
    }

    /// Redirect to `url` with the given status (301, 302, 303, 307, 308).
    pub fn redirect(url: impl Into<String>, status: u16) -> Self {
        Self {
            verdict: Verdict::Redirect {
                url: url.into(),
                status,
            },
            ..Self::allow()
        }
    }

    /// Permanent redirect (301).
    pub fn redirect_permanent(url: impl Into<String>) -> Self {
        Self::redirect(url, 301)
    }

    /// Challenge the client.
    pub fn challenge(
        challenge_type: impl Into<String>,
        params: HashMap<String, String>,
    ) -> Self {
        Self {
            verdict: Verdict::Challenge {
                challenge_type: challenge_type.into(),
                params,
            },
            ..Self::allow()
        }
    }

    /// Set the synthesized response body. Only meaningful for block verdicts.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        if let Verdict::Block { body: b, .. } = &mut self.verdict {
            *b = Some(body.into());
        }
        self
    }

    /// Add a header to the synthesized block response.
    pub fn with_block_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Verdict::Block { headers, .. } = &mut self.verdict {
            headers
                .get_or_insert_with(HashMap::new)
                .insert(name.into(), value.into());
        }
        self
    }

    /// Set a header on the upstream request.
    pub fn add_request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push(HeaderOp::Set {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Remove a header from the upstream request.
    pub fn remove_request_header(mut self, name: impl Into<String>) -> Self {
        self.request_headers.push(HeaderOp::Remove { name: name.into() });
        self
    }

    /// Set a header on the client response.
    pub fn add_response_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.response_headers.push(HeaderOp::Set {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Remove a header from the client response.
    pub fn remove_response_header(mut self, name: impl Into<String>) -> Self {
        self.response_headers
            .push(HeaderOp::Remove { name: name.into() });
        self
    }

    /// Push a raw header operation onto the upstream request.
    pub fn with_request_header_op(mut self, op: HeaderOp) -> Self {
        self.request_headers.push(op);
        self
    }

    /// Push a raw header operation onto the client response.
    pub fn with_response_header_op(mut self, op: HeaderOp) -> Self {
        self.response_headers.push(op);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.audit.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.audit.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.audit.rule_ids.push(rule_id.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.audit.confidence = Some(confidence);
        self
    }

    pub fn with_reason_code(mut self, code: impl Into<String>) -> Self {
        self.audit.reason_codes.push(code.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.audit.custom.insert(key.into(), value);
        self
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    pub fn is_allow(&self) -> bool {
        matches!(self.verdict, Verdict::Allow)
    }

    /// Turn this decision into the wire payload for `request_id`.
    pub fn into_message(self, request_id: u64) -> DecisionMessage {
        DecisionMessage {
            request_id,
            decision: self.verdict,
            request_headers: self.request_headers,
            response_headers: self.response_headers,
            audit: self.audit,
        }
    }
}

/// Body mutation frame payload (0x21).
///
/// - `None` data: pass the original chunk through unchanged
/// - `Some("")`: drop the chunk entirely
/// - `Some(data)`: replace the chunk (base64)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyMutationMessage {
    pub request_id: u64,
    pub data: Option<String>,
    /// Chunk index this mutation applies to
    #[serde(default)]
    pub chunk_index: u32,
}

impl BodyMutationMessage {
    pub fn pass_through(request_id: u64, chunk_index: u32) -> Self {
        Self {
            request_id,
            data: None,
            chunk_index,
        }
    }

    pub fn drop_chunk(request_id: u64, chunk_index: u32) -> Self {
        Self {
            request_id,
            data: Some(String::new()),
            chunk_index,
        }
    }

    pub fn replace(request_id: u64, chunk_index: u32, data: &[u8]) -> Self {
        Self {
            request_id,
            data: Some(crate::protocol::encode_chunk_data(data)),
            chunk_index,
        }
    }

    pub fn is_pass_through(&self) -> bool {
        self.data.is_none()
    }

    pub fn is_drop(&self) -> bool {
        matches!(&self.data, Some(d) if d.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn allow_serializes_as_bare_string() {
        assert_eq!(serde_json::to_value(Verdict::Allow).unwrap(), json!("allow"));
    }

    #[test]
    fn block_serializes_as_tagged_object() {
        let verdict = Verdict::Block {
            status: 403,
            body: Some("nope".to_string()),
            headers: None,
        };
        assert_eq!(
            serde_json::to_value(&verdict).unwrap(),
            json!({"block": {"status": 403, "body": "nope"}})
        );
    }

    #[test]
    fn needs_more_serializes_as_flag_object() {
        assert_eq!(
            serde_json::to_value(Verdict::NeedsMore(true)).unwrap(),
            json!({"needs_more": true})
        );

        let parsed: Verdict = serde_json::from_value(json!({"needs_more": true})).unwrap();
        assert_eq!(parsed, Verdict::NeedsMore(true));
    }

    #[test]
    fn redirect_and_challenge_shapes() {
        assert_eq!(
            serde_json::to_value(Verdict::Redirect {
                url: "https://example.com/login".to_string(),
                status: 302,
            })
            .unwrap(),
            json!({"redirect": {"url": "https://example.com/login", "status": 302}})
        );

        let parsed: Verdict = serde_json::from_value(
            json!({"challenge": {"challenge_type": "captcha", "params": {"site": "k"}}}),
        )
        .unwrap();
        match parsed {
            Verdict::Challenge {
                challenge_type,
                params,
            } => {
                assert_eq!(challenge_type, "captcha");
                assert_eq!(params["site"], "k");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn header_op_wire_shape() {
        let op = HeaderOp::Set {
            name: "X-Agent".to_string(),
            value: "waf".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"operation": "set", "name": "X-Agent", "value": "waf"})
        );

        let parsed: HeaderOp =
            serde_json::from_value(json!({"operation": "remove", "name": "Server"})).unwrap();
        assert_eq!(
            parsed,
            HeaderOp::Remove {
                name: "Server".to_string()
            }
        );
    }

    #[test]
    fn builder_shortcuts() {
        assert_eq!(
            *Decision::deny().verdict(),
            Verdict::Block {
                status: 403,
                body: None,
                headers: None
            }
        );
        assert!(matches!(
            Decision::rate_limited().verdict(),
            Verdict::Block { status: 429, .. }
        ));
        assert!(matches!(
            Decision::redirect_permanent("https://example.com").verdict(),
            Verdict::Redirect { status: 301, .. }
        ));
    }

    #[test]
    fn block_body_and_headers_attach_to_the_verdict() {
        let decision = Decision::deny()
            .with_body("Forbidden")
            .with_block_header("Content-Type", "text/plain");

        match decision.verdict() {
            Verdict::Block { body, headers, .. } => {
                assert_eq!(body.as_deref(), Some("Forbidden"));
                assert_eq!(headers.as_ref().unwrap()["Content-Type"], "text/plain");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn into_message_carries_ops_and_audit() {
        let msg = Decision::allow()
            .add_request_header("X-Checked", "true")
            .remove_response_header("Server")
            .with_tag("echo")
            .with_confidence(0.75)
            .into_message(9);

        assert_eq!(msg.request_id, 9);
        assert_eq!(msg.request_headers.len(), 1);
        assert_eq!(msg.response_headers.len(), 1);
        assert_eq!(msg.audit.tags, vec!["echo"]);
        assert_eq!(msg.audit.confidence, Some(0.75));
    }

    #[test]
    fn audit_is_omitted_when_empty() {
        let json = serde_json::to_value(DecisionMessage::allow(1)).unwrap();
        assert_eq!(json, json!({"request_id": 1, "decision": "allow"}));
    }

    #[test]
    fn body_mutation_modes() {
        assert!(BodyMutationMessage::pass_through(1, 0).is_pass_through());
        assert!(BodyMutationMessage::drop_chunk(1, 0).is_drop());

        let replace = BodyMutationMessage::replace(1, 2, b"redacted");
        assert!(!replace.is_pass_through());
        assert!(!replace.is_drop());
        assert_eq!(replace.chunk_index, 2);
    }
}
