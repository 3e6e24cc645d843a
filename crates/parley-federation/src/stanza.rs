//! Wire shapes exchanged on server-to-server streams.
//!
//! ```text
//! <stream:stream xmlns:stream='http://etherx.jabber.org/streams'
//!                xmlns='jabber:server' xmlns:db='jabber:server:dialback'
//!                from='a.example' to='b.example' id='S1' version='1.0'>
//!
//!   <db:result from='a.example' to='b.example'>KEY</db:result>        result-offer
//!   <db:result from='b.example' to='a.example' type='valid'/>         result-answer
//!   <db:verify from='b.example' to='a.example' id='S1'>KEY</db:verify> verify-request
//!   <db:verify from='a.example' to='b.example' id='S1' type='valid'/> verify-response
//! ```
//!
//! Elements are kept as a small owned tree ([`Element`]); the qualified names
//! are matched as written (`db:result`, `stream:features`) since every peer
//! we interoperate with uses the conventional prefixes.

use std::fmt::Write as _;

use quick_xml::escape::escape;

use crate::error::StreamErrorCondition;

pub const NS_SERVER: &str = "jabber:server";
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
pub const NS_DIALBACK: &str = "jabber:server:dialback";
pub const NS_DIALBACK_FEATURE: &str = "urn:xmpp:features:dialback";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

// ─── Generic element ─────────────────────────────────────────────────────────

/// A parsed stream-level child element.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Local part of the qualified name (`db:result` → `result`).
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    /// Serialise back to XML text.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        let _ = write!(out, "<{}", self.name);
        for (k, v) in &self.attrs {
            let _ = write!(out, " {}='{}'", k, escape(v.as_str()));
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.write_xml(out);
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

// ─── Stream header ───────────────────────────────────────────────────────────

/// Attributes of a `<stream:stream>` opening tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamHeader {
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    /// Default namespace (`xmlns`).
    pub default_ns: Option<String>,
    /// Whether `xmlns:db` was declared with the dialback namespace.
    pub declares_dialback: bool,
}

impl StreamHeader {
    /// Header an initiating party sends (no `id`).
    pub fn initiating(from: &str, to: &str) -> Self {
        Self {
            from: Some(from.to_owned()),
            to: Some(to.to_owned()),
            id: None,
            version: Some("1.0".into()),
            default_ns: Some(NS_SERVER.into()),
            declares_dialback: true,
        }
    }

    /// Header a responding party sends back with its fresh stream identifier.
    pub fn responding(from: &str, to: Option<&str>, id: &str, version: Option<&str>) -> Self {
        Self {
            from: Some(from.to_owned()),
            to: to.map(str::to_owned),
            id: Some(id.to_owned()),
            version: version.map(str::to_owned),
            default_ns: Some(NS_SERVER.into()),
            declares_dialback: true,
        }
    }

    /// True for `version='1.0'` or later, i.e. the peer expects stream features.
    pub fn supports_features(&self) -> bool {
        self.version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.parse::<u32>().ok())
            .is_some_and(|major| major >= 1)
    }

    pub(crate) fn from_attrs(attrs: &[(String, String)]) -> Self {
        let get = |k: &str| attrs.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        Self {
            from: get("from"),
            to: get("to"),
            id: get("id"),
            version: get("version"),
            default_ns: get("xmlns"),
            declares_dialback: get("xmlns:db").as_deref() == Some(NS_DIALBACK),
        }
    }

    /// Opening tag, preceded by the XML declaration.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version='1.0' encoding='UTF-8'?>");
        let _ = write!(out, "<stream:stream xmlns:stream='{NS_STREAM}'");
        let _ = write!(out, " xmlns='{}'", self.default_ns.as_deref().unwrap_or(NS_SERVER));
        if self.declares_dialback {
            let _ = write!(out, " xmlns:db='{NS_DIALBACK}'");
        }
        for (k, v) in [("from", &self.from), ("to", &self.to), ("id", &self.id), ("version", &self.version)] {
            if let Some(v) = v {
                let _ = write!(out, " {}='{}'", k, escape(v.as_str()));
            }
        }
        out.push('>');
        out
    }
}

pub const STREAM_CLOSE: &str = "</stream:stream>";

/// `<stream:error>` followed by the closing tag.
pub fn stream_error_xml(condition: StreamErrorCondition) -> String {
    format!(
        "<stream:error><{} xmlns='{NS_STREAM_ERRORS}'/></stream:error>{STREAM_CLOSE}",
        condition.as_str()
    )
}

/// Condition carried by a received `<stream:error>`.
pub fn parse_stream_error(el: &Element) -> StreamErrorCondition {
    el.children
        .iter()
        .find(|c| c.attr("xmlns") == Some(NS_STREAM_ERRORS))
        .map(|c| StreamErrorCondition::from_name(&c.name))
        .unwrap_or(StreamErrorCondition::UndefinedCondition)
}

// ─── Stream features ─────────────────────────────────────────────────────────

/// What a peer advertised in `<stream:features>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub starttls: bool,
    pub dialback: bool,
    pub mechanisms: Vec<String>,
}

impl StreamFeatures {
    pub fn parse(el: &Element) -> Self {
        let mut features = StreamFeatures::default();
        for child in &el.children {
            match (child.local_name(), child.attr("xmlns")) {
                ("starttls", Some(NS_TLS)) => features.starttls = true,
                ("dialback", Some(NS_DIALBACK_FEATURE)) => features.dialback = true,
                ("mechanisms", Some(NS_SASL)) => {
                    features.mechanisms = child
                        .children
                        .iter()
                        .filter(|m| m.local_name() == "mechanism")
                        .map(|m| m.text.trim().to_owned())
                        .collect();
                }
                _ => {}
            }
        }
        features
    }

    pub fn offers_external(&self) -> bool {
        self.mechanisms.iter().any(|m| m == "EXTERNAL")
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("stream:features");
        if self.starttls {
            el = el.with_child(Element::new("starttls").with_attr("xmlns", NS_TLS));
        }
        if !self.mechanisms.is_empty() {
            let mut mechs = Element::new("mechanisms").with_attr("xmlns", NS_SASL);
            for m in &self.mechanisms {
                mechs = mechs.with_child(Element::new("mechanism").with_text(m.clone()));
            }
            el = el.with_child(mechs);
        }
        if self.dialback {
            el = el.with_child(Element::new("dialback").with_attr("xmlns", NS_DIALBACK_FEATURE));
        }
        el
    }
}

// ─── Dialback stanzas ────────────────────────────────────────────────────────

/// Outcome carried in a `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid,
}

impl Verdict {
    pub fn from_bool(valid: bool) -> Self {
        if valid { Verdict::Valid } else { Verdict::Invalid }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Valid => "valid",
            Verdict::Invalid => "invalid",
        }
    }

    pub fn is_valid(&self) -> bool {
        *self == Verdict::Valid
    }
}

/// `<db:result>` in either direction: with a key it is an offer, with a
/// `type` it is an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialbackResult {
    pub from: String,
    pub to: String,
    pub key: Option<String>,
    pub verdict: Option<Verdict>,
}

impl DialbackResult {
    pub fn offer(from: &str, to: &str, key: &str) -> Self {
        Self { from: from.into(), to: to.into(), key: Some(key.into()), verdict: None }
    }

    pub fn answer(from: &str, to: &str, verdict: Verdict) -> Self {
        Self { from: from.into(), to: to.into(), key: None, verdict: Some(verdict) }
    }

    /// `None` unless the element is a `db:result` with `from` and `to`.
    pub fn parse(el: &Element) -> Option<Self> {
        if el.name != "db:result" {
            return None;
        }
        Some(Self {
            from: el.attr("from")?.to_owned(),
            to: el.attr("to")?.to_owned(),
            key: non_empty(&el.text),
            verdict: parse_verdict(el),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("db:result")
            .with_attr("from", self.from.clone())
            .with_attr("to", self.to.clone());
        if let Some(v) = self.verdict {
            el = el.with_attr("type", v.as_str());
        }
        if let Some(key) = &self.key {
            el = el.with_text(key.clone());
        }
        el
    }
}

/// `<db:verify>` request (with key) or response (with `type`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialbackVerify {
    pub from: String,
    pub to: String,
    pub id: String,
    pub key: Option<String>,
    pub verdict: Option<Verdict>,
}

impl DialbackVerify {
    pub fn request(from: &str, to: &str, id: &str, key: &str) -> Self {
        Self { from: from.into(), to: to.into(), id: id.into(), key: Some(key.into()), verdict: None }
    }

    pub fn response(from: &str, to: &str, id: &str, verdict: Verdict) -> Self {
        Self { from: from.into(), to: to.into(), id: id.into(), key: None, verdict: Some(verdict) }
    }

    pub fn parse(el: &Element) -> Option<Self> {
        if el.name != "db:verify" {
            return None;
        }
        Some(Self {
            from: el.attr("from")?.to_owned(),
            to: el.attr("to")?.to_owned(),
            id: el.attr("id")?.to_owned(),
            key: non_empty(&el.text),
            verdict: parse_verdict(el),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("db:verify")
            .with_attr("from", self.from.clone())
            .with_attr("to", self.to.clone())
            .with_attr("id", self.id.clone());
        if let Some(v) = self.verdict {
            el = el.with_attr("type", v.as_str());
        }
        if let Some(key) = &self.key {
            el = el.with_text(key.clone());
        }
        el
    }
}

fn parse_verdict(el: &Element) -> Option<Verdict> {
    match el.attr("type") {
        Some("valid") => Some(Verdict::Valid),
        Some("invalid") => Some(Verdict::Invalid),
        _ => None,
    }
}

fn non_empty(text: &str) -> Option<String> {
    let t = text.trim();
    (!t.is_empty()).then(|| t.to_owned())
}
