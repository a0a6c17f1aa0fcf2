//! Hotkey grammar and key-event signatures
//!
//! Registry authors write shortcuts loosely ("Ctrl+Shift+A", "cmd + k",
//! "option+SHIFT+p"). Everything is folded into a [`HotkeySpec`] whose
//! equality ignores token order, case and modifier synonyms, so a spec can be
//! compared directly against the signature of a [`KeyEvent`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when a hotkey string cannot be normalized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HotkeyParseError {
    #[error("hotkey string is empty")]
    Empty,
    #[error("hotkey has no key, only modifiers")]
    MissingKey,
}

/// Modifier key. Variant order is lexicographic so a `BTreeSet<Modifier>`
/// iterates in the canonical sorted order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Alt,
    Ctrl,
    Meta,
    Shift,
}

impl Modifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alt => "alt",
            Self::Ctrl => "ctrl",
            Self::Meta => "meta",
            Self::Shift => "shift",
        }
    }

    /// Map a case-folded token to a modifier, including synonyms.
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "ctrl" | "control" => Some(Self::Ctrl),
            "alt" | "option" => Some(Self::Alt),
            "shift" => Some(Self::Shift),
            "meta" | "win" | "super" | "cmd" | "command" => Some(Self::Meta),
            _ => None,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized shortcut: a sorted modifier set plus one lower-cased key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HotkeySpec {
    mods: BTreeSet<Modifier>,
    key: String,
}

impl HotkeySpec {
    pub fn new(key: impl AsRef<str>, mods: impl IntoIterator<Item = Modifier>) -> Self {
        Self {
            mods: mods.into_iter().collect(),
            key: key.as_ref().to_lowercase(),
        }
    }

    /// Parse a shortcut string.
    ///
    /// The input is case-folded, stripped of all whitespace and split on `+`.
    /// Recognized modifier tokens go into the set; the remaining token is the
    /// key. When several non-modifier tokens appear the last one wins.
    ///
    /// - `"Ctrl+Shift+A"` -> ctrl+shift+a
    /// - `"shift + CMD + k"` -> meta+shift+k
    /// - `"alt+"` -> [`HotkeyParseError::MissingKey`]
    pub fn parse(input: &str) -> Result<Self, HotkeyParseError> {
        let folded: String = input
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if folded.is_empty() {
            return Err(HotkeyParseError::Empty);
        }

        let mut mods = BTreeSet::new();
        let mut key = None;
        for token in folded.split('+').filter(|t| !t.is_empty()) {
            match Modifier::from_token(token) {
                Some(modifier) => {
                    mods.insert(modifier);
                }
                None => key = Some(token),
            }
        }

        let key = key.ok_or(HotkeyParseError::MissingKey)?;
        Ok(Self {
            mods,
            key: key.to_string(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Modifiers in sorted order.
    pub fn mods(&self) -> impl Iterator<Item = Modifier> + '_ {
        self.mods.iter().copied()
    }

    pub fn has(&self, modifier: Modifier) -> bool {
        self.mods.contains(&modifier)
    }
}

impl fmt::Display for HotkeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for modifier in &self.mods {
            write!(f, "{modifier}+")?;
        }
        f.write_str(&self.key)
    }
}

impl FromStr for HotkeySpec {
    type Err = HotkeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for HotkeySpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HotkeySpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        HotkeySpec::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// The element a key event was aimed at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTarget {
    /// Element tag name (e.g. `input`, `div`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub content_editable: bool,
}

impl KeyTarget {
    pub fn element(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            content_editable: false,
        }
    }

    pub fn editable() -> Self {
        Self {
            tag: None,
            content_editable: true,
        }
    }

    /// Text-entry targets never trigger shortcuts.
    pub fn is_typing_target(&self) -> bool {
        if self.content_editable {
            return true;
        }
        self.tag.as_deref().is_some_and(|tag| {
            tag.eq_ignore_ascii_case("input")
                || tag.eq_ignore_ascii_case("textarea")
                || tag.eq_ignore_ascii_case("select")
        })
    }
}

/// A key-down event as delivered by the host page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub key: String,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub target: KeyTarget,
    /// Set once some handler has consumed the event
    #[serde(default)]
    pub default_prevented: bool,
}

impl KeyEvent {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Synthesize the event a user would produce by pressing `spec`.
    pub fn from_hotkey(spec: &HotkeySpec) -> Self {
        Self {
            key: spec.key().to_string(),
            ctrl: spec.has(Modifier::Ctrl),
            alt: spec.has(Modifier::Alt),
            shift: spec.has(Modifier::Shift),
            meta: spec.has(Modifier::Meta),
            ..Default::default()
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn on(mut self, target: KeyTarget) -> Self {
        self.target = target;
        self
    }

    /// Signature built from the modifier flags and the lower-cased key.
    pub fn signature(&self) -> HotkeySpec {
        let flags = [
            (self.ctrl, Modifier::Ctrl),
            (self.alt, Modifier::Alt),
            (self.shift, Modifier::Shift),
            (self.meta, Modifier::Meta),
        ];
        HotkeySpec::new(
            &self.key,
            flags
                .into_iter()
                .filter_map(|(pressed, modifier)| pressed.then_some(modifier)),
        )
    }

    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_combo() {
        let spec = HotkeySpec::parse("Ctrl+Shift+A").unwrap();
        assert_eq!(spec.key(), "a");
        assert_eq!(
            spec.mods().collect::<Vec<_>>(),
            vec![Modifier::Ctrl, Modifier::Shift]
        );
    }

    #[test]
    fn order_case_and_synonyms_are_irrelevant() {
        let a = HotkeySpec::parse("cmd+shift+k").unwrap();
        let b = HotkeySpec::parse("SHIFT + Meta + K").unwrap();
        let c = HotkeySpec::parse("shift+command+k").unwrap();
        let d = HotkeySpec::parse("super+shift+k").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(c, d);

        let e = HotkeySpec::parse("option+p").unwrap();
        let f = HotkeySpec::parse("ALT+P").unwrap();
        assert_eq!(e, f);

        let g = HotkeySpec::parse("control+win+x").unwrap();
        let h = HotkeySpec::parse("meta+ctrl+x").unwrap();
        assert_eq!(g, h);
    }

    #[test]
    fn mods_are_sorted() {
        let spec = HotkeySpec::parse("shift+meta+ctrl+alt+z").unwrap();
        assert_eq!(
            spec.mods().map(|m| m.as_str()).collect::<Vec<_>>(),
            vec!["alt", "ctrl", "meta", "shift"]
        );
    }

    #[test]
    fn whitespace_is_stripped_not_split() {
        let spec = HotkeySpec::parse("  ctrl +  k ").unwrap();
        assert_eq!(spec.to_string(), "ctrl+k");

        // whitespace is not a delimiter
        let spec = HotkeySpec::parse("ALT P").unwrap();
        assert_eq!(spec.key(), "altp");
        assert_eq!(spec.mods().count(), 0);
    }

    #[test]
    fn modifiers_only_is_invalid() {
        assert_eq!(
            HotkeySpec::parse("ctrl+shift"),
            Err(HotkeyParseError::MissingKey)
        );
        assert_eq!(HotkeySpec::parse("alt+"), Err(HotkeyParseError::MissingKey));
        assert_eq!(HotkeySpec::parse("+"), Err(HotkeyParseError::MissingKey));
    }

    #[test]
    fn empty_is_invalid() {
        assert_eq!(HotkeySpec::parse(""), Err(HotkeyParseError::Empty));
        assert_eq!(HotkeySpec::parse("   "), Err(HotkeyParseError::Empty));
    }

    #[test]
    fn last_key_token_wins() {
        let spec = HotkeySpec::parse("ctrl+a+b").unwrap();
        assert_eq!(spec.key(), "b");
    }

    #[test]
    fn named_keys_survive() {
        let spec = HotkeySpec::parse("Alt+Escape").unwrap();
        assert_eq!(spec.key(), "escape");
        assert_eq!(spec.to_string(), "alt+escape");
    }

    #[test]
    fn serde_as_string() {
        let spec = HotkeySpec::parse("Shift+Ctrl+A").unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, "\"ctrl+shift+a\"");

        let parsed: HotkeySpec = serde_json::from_str("\"CMD+q\"").unwrap();
        assert_eq!(parsed, HotkeySpec::new("q", [Modifier::Meta]));

        assert!(serde_json::from_str::<HotkeySpec>("\"shift\"").is_err());
    }

    #[test]
    fn event_signature_matches_spec() {
        let spec = HotkeySpec::parse("Ctrl+Shift+A").unwrap();

        let event = KeyEvent::new("A").ctrl().shift();
        assert_eq!(event.signature(), spec);

        let event = KeyEvent::new("A").ctrl();
        assert_ne!(event.signature(), spec);
    }

    #[test]
    fn event_from_hotkey_roundtrips_signature() {
        let spec = HotkeySpec::parse("meta+alt+enter").unwrap();
        assert_eq!(KeyEvent::from_hotkey(&spec).signature(), spec);
    }

    #[test]
    fn typing_targets() {
        assert!(KeyTarget::element("INPUT").is_typing_target());
        assert!(KeyTarget::element("textarea").is_typing_target());
        assert!(KeyTarget::element("select").is_typing_target());
        assert!(KeyTarget::editable().is_typing_target());
        assert!(!KeyTarget::element("div").is_typing_target());
        assert!(!KeyTarget::default().is_typing_target());
    }

    #[test]
    fn key_event_wire_defaults() {
        let event: KeyEvent = serde_json::from_str(r#"{"key":"k","ctrl":true}"#).unwrap();
        assert!(event.ctrl);
        assert!(!event.shift);
        assert!(!event.default_prevented);
        assert_eq!(event.target, KeyTarget::default());
    }
}
