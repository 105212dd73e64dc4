//! Platform selection
//!
//! Each registered [`PlatformSignature`] is evaluated against the host in
//! registration order and yields NO_MATCH, MAYBE or MATCH. The [`Policy`]
//! then decides which of those, if any, becomes the active platform.
//! Evaluation never fails; callers turn the [`SelectionResult`] into a
//! decision with [`SelectionResult::into_outcome`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use bm_error::{BootmetaError, SelectionError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capabilities::{DeviceQuery, FirmwareField};
use crate::context::DetectionContext;

/// Name of the no-op fallback platform
pub const FALLBACK_PLATFORM: &str = "None";

// ============================================================================
// Signatures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchOutcome {
    NoMatch,
    Maybe,
    Match,
}

/// A single piece of host evidence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    FirmwareEquals {
        field: FirmwareField,
        value: String,
        ignore_case: bool,
    },
    FirmwarePrefix {
        field: FirmwareField,
        value: String,
        ignore_case: bool,
    },
    FirmwareSuffix {
        field: FirmwareField,
        value: String,
        ignore_case: bool,
    },
    /// Both fields present and equal, ignoring case
    FirmwareFieldsEqual(FirmwareField, FirmwareField),
    FileExists(PathBuf),
    /// A block device carries this filesystem label
    DeviceLabel(String),
    /// A volume of `fstype` has `marker` at its root
    VolumeMarker { fstype: String, marker: String },
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Always,
}

fn fold(value: &str, ignore_case: bool) -> String {
    if ignore_case {
        value.to_ascii_lowercase()
    } else {
        value.to_string()
    }
}

impl Predicate {
    pub fn firmware_equals(field: FirmwareField, value: &str) -> Self {
        Self::FirmwareEquals {
            field,
            value: value.to_string(),
            ignore_case: false,
        }
    }

    pub fn firmware_prefix(field: FirmwareField, value: &str, ignore_case: bool) -> Self {
        Self::FirmwarePrefix {
            field,
            value: value.to_string(),
            ignore_case,
        }
    }

    pub fn firmware_suffix(field: FirmwareField, value: &str, ignore_case: bool) -> Self {
        Self::FirmwareSuffix {
            field,
            value: value.to_string(),
            ignore_case,
        }
    }

    pub fn holds(&self, ctx: &DetectionContext<'_>) -> bool {
        match self {
            Self::FirmwareEquals { field, value, ignore_case } => ctx
                .firmware_field(*field)
                .is_some_and(|actual| fold(&actual, *ignore_case) == fold(value, *ignore_case)),
            Self::FirmwarePrefix { field, value, ignore_case } => ctx
                .firmware_field(*field)
                .is_some_and(|actual| fold(&actual, *ignore_case).starts_with(&fold(value, *ignore_case))),
            Self::FirmwareSuffix { field, value, ignore_case } => ctx
                .firmware_field(*field)
                .is_some_and(|actual| fold(&actual, *ignore_case).ends_with(&fold(value, *ignore_case))),
            Self::FirmwareFieldsEqual(a, b) => match (ctx.firmware_field(*a), ctx.firmware_field(*b)) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(&b),
                _ => false,
            },
            Self::FileExists(path) => path.exists(),
            Self::DeviceLabel(label) => !ctx.candidates(&DeviceQuery::Label(label.clone())).is_empty(),
            Self::VolumeMarker { fstype, marker } => ctx.volume_has_marker(fstype, marker),
            Self::All(preds) => preds.iter().all(|p| p.holds(ctx)),
            Self::Any(preds) => preds.iter().any(|p| p.holds(ctx)),
            Self::Always => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub predicate: Predicate,
    pub on_hit: MatchOutcome,
}

/// Detection rules for one platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSignature {
    pub name: String,
    pub checks: Vec<Check>,
}

impl PlatformSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checks: Vec::new(),
        }
    }

    pub fn check(mut self, predicate: Predicate, on_hit: MatchOutcome) -> Self {
        self.checks.push(Check { predicate, on_hit });
        self
    }

    /// Strongest outcome among the checks that hold; stops at the first MATCH.
    pub fn evaluate(&self, ctx: &DetectionContext<'_>) -> MatchOutcome {
        let mut best = MatchOutcome::NoMatch;
        for check in &self.checks {
            if check.on_hit <= best {
                continue;
            }
            if check.predicate.holds(ctx) {
                best = check.on_hit;
                if best == MatchOutcome::Match {
                    break;
                }
            }
        }
        best
    }
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Search,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FoundPolicy {
    All,
    First,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaybePolicy {
    All,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotFoundPolicy {
    Enabled,
    Disabled,
}

/// How signature outcomes turn into a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub mode: Mode,
    pub found: FoundPolicy,
    pub maybe: MaybePolicy,
    pub notfound: NotFoundPolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            mode: Mode::Search,
            found: FoundPolicy::All,
            maybe: MaybePolicy::All,
            notfound: NotFoundPolicy::Disabled,
        }
    }
}

impl FromStr for Policy {
    type Err = BootmetaError;

    /// Parse `search,found=all,maybe=all,notfound=disabled`; omitted axes keep
    /// their defaults.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut policy = Policy::default();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                None => {
                    policy.mode = match token {
                        "search" => Mode::Search,
                        "disabled" => Mode::Disabled,
                        other => return Err(BootmetaError::config(format!("Unknown policy mode: {}", other))),
                    }
                }
                Some(("found", v)) => {
                    policy.found = match v {
                        "all" => FoundPolicy::All,
                        "first" => FoundPolicy::First,
                        other => return Err(BootmetaError::config(format!("Invalid found policy: {}", other))),
                    }
                }
                Some(("maybe", v)) => {
                    policy.maybe = match v {
                        "all" => MaybePolicy::All,
                        "none" => MaybePolicy::None,
                        other => return Err(BootmetaError::config(format!("Invalid maybe policy: {}", other))),
                    }
                }
                Some(("notfound", v)) => {
                    policy.notfound = match v {
                        "enabled" => NotFoundPolicy::Enabled,
                        "disabled" => NotFoundPolicy::Disabled,
                        other => {
                            return Err(BootmetaError::config(format!("Invalid notfound policy: {}", other)))
                        }
                    }
                }
                Some((key, _)) => return Err(BootmetaError::config(format!("Unknown policy key: {}", key))),
            }
        }
        Ok(policy)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Mode::Search => "search",
            Mode::Disabled => "disabled",
        };
        let found = match self.found {
            FoundPolicy::All => "all",
            FoundPolicy::First => "first",
        };
        let maybe = match self.maybe {
            MaybePolicy::All => "all",
            MaybePolicy::None => "none",
        };
        let notfound = match self.notfound {
            NotFoundPolicy::Enabled => "enabled",
            NotFoundPolicy::Disabled => "disabled",
        };
        write!(f, "{},found={},maybe={},notfound={}", mode, found, maybe, notfound)
    }
}

// ============================================================================
// Selection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionState {
    Found,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionResult {
    pub state: SelectionState,
    pub platform: Option<String>,
    /// Platforms to try, in order
    pub candidates: Vec<String>,
    /// The no-op fallback platform was chosen
    pub fallback: bool,
    /// Every platform that matched when `found=all` could not pick one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ambiguity: Option<Vec<String>>,
    pub diagnostics: Vec<String>,
}

impl SelectionResult {
    fn not_found(diagnostics: Vec<String>) -> Self {
        Self {
            state: SelectionState::NotFound,
            platform: None,
            candidates: Vec::new(),
            fallback: false,
            ambiguity: None,
            diagnostics,
        }
    }

    /// Candidates to run, or why there are none
    pub fn into_outcome(self) -> Result<Vec<String>, SelectionError> {
        if let Some(names) = self.ambiguity {
            return Err(SelectionError::Ambiguous(names));
        }
        if self.candidates.is_empty() {
            return Err(SelectionError::NotFound);
        }
        Ok(self.candidates)
    }
}

#[derive(Debug, Default)]
pub struct PlatformSelector {
    signatures: Vec<PlatformSignature>,
}

impl PlatformSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, signature: PlatformSignature) {
        self.signatures.push(signature);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signatures.iter().map(|s| s.name.as_str())
    }

    /// Keep only signatures named in `allowed`, preserving registration order
    pub fn retain_named(&mut self, allowed: &[String]) {
        self.signatures.retain(|s| allowed.iter().any(|a| a == &s.name));
    }

    pub fn evaluate(&self, ctx: &DetectionContext<'_>, policy: &Policy) -> SelectionResult {
        let mut diagnostics = Vec::new();
        if policy.mode == Mode::Disabled {
            diagnostics.push("platform detection disabled by policy".to_string());
            return SelectionResult::not_found(diagnostics);
        }

        let mut matches = Vec::new();
        let mut maybes = Vec::new();
        for signature in &self.signatures {
            let outcome = signature.evaluate(ctx);
            debug!(platform = %signature.name, outcome = ?outcome, "Evaluated platform signature");
            match outcome {
                MatchOutcome::Match => {
                    matches.push(signature.name.clone());
                    if policy.found == FoundPolicy::First {
                        break;
                    }
                }
                MatchOutcome::Maybe => maybes.push(signature.name.clone()),
                MatchOutcome::NoMatch => {}
            }
        }

        match (matches.len(), policy.found) {
            (0, _) => {}
            (1, _) | (_, FoundPolicy::First) => {
                let platform = matches.swap_remove(0);
                info!(platform = %platform, "Platform identified");
                return SelectionResult {
                    state: SelectionState::Found,
                    platform: Some(platform.clone()),
                    candidates: vec![platform],
                    fallback: false,
                    ambiguity: None,
                    diagnostics,
                };
            }
            (_, FoundPolicy::All) => {
                warn!(platforms = ?matches, "Multiple platforms matched");
                diagnostics.push(format!("ambiguous: multiple platforms matched: {}", matches.join(", ")));
                let mut result = SelectionResult::not_found(diagnostics);
                result.ambiguity = Some(matches);
                return result;
            }
        }

        if !maybes.is_empty() {
            if policy.maybe == MaybePolicy::All {
                info!(platforms = ?maybes, "No definite platform, promoting possible ones");
                diagnostics.push(format!("found by maybe: {}", maybes.join(", ")));
                return SelectionResult {
                    state: SelectionState::Found,
                    platform: maybes.first().cloned(),
                    candidates: maybes,
                    fallback: false,
                    ambiguity: None,
                    diagnostics,
                };
            }
            diagnostics.push(format!("ignoring possible platforms under maybe=none: {}", maybes.join(", ")));
        }

        diagnostics.push("no platform identified".to_string());
        if policy.notfound == NotFoundPolicy::Enabled {
            info!("No platform identified, using fallback");
            return SelectionResult {
                state: SelectionState::NotFound,
                platform: Some(FALLBACK_PLATFORM.to_string()),
                candidates: vec![FALLBACK_PLATFORM.to_string()],
                fallback: true,
                ambiguity: None,
                diagnostics,
            };
        }
        SelectionResult::not_found(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::SystemClock;
    use crate::test_utils::{FakeDevices, FakeFirmware, FakeInterfaces};

    fn create_test_selector(specs: &[(&str, MatchOutcome)]) -> PlatformSelector {
        let mut selector = PlatformSelector::new();
        for (name, outcome) in specs {
            let predicate = if *outcome == MatchOutcome::NoMatch {
                Predicate::firmware_equals(FirmwareField::ProductName, "never")
            } else {
                Predicate::Always
            };
            selector.register(PlatformSignature::new(*name).check(predicate, *outcome));
        }
        selector
    }

    fn evaluate(selector: &PlatformSelector, policy: &str) -> SelectionResult {
        let firmware = FakeFirmware::default();
        let devices = FakeDevices::default();
        let interfaces = FakeInterfaces::default();
        let clock = SystemClock::new();
        let ctx = DetectionContext::new(&firmware, &devices, &interfaces, &clock);
        selector.evaluate(&ctx, &policy.parse().unwrap())
    }

    #[test]
    fn test_found_first_prefers_earliest_registration() {
        let selector = create_test_selector(&[("A", MatchOutcome::Match), ("B", MatchOutcome::Match)]);
        let result = evaluate(&selector, "found=first");
        assert_eq!(result.state, SelectionState::Found);
        assert_eq!(result.platform.as_deref(), Some("A"));
        assert_eq!(result.into_outcome().unwrap(), vec!["A"]);
    }

    #[test]
    fn test_found_all_with_two_matches_is_ambiguous() {
        let selector = create_test_selector(&[("A", MatchOutcome::Match), ("B", MatchOutcome::Match)]);
        let result = evaluate(&selector, "found=all,notfound=enabled");
        assert_eq!(result.state, SelectionState::NotFound);
        assert!(!result.fallback);
        assert!(result.diagnostics[0].contains("ambiguous"));
        assert_eq!(
            result.into_outcome(),
            Err(SelectionError::Ambiguous(vec!["A".into(), "B".into()]))
        );
    }

    #[test]
    fn test_single_match_beats_maybes() {
        let selector = create_test_selector(&[("A", MatchOutcome::Maybe), ("B", MatchOutcome::Match)]);
        let result = evaluate(&selector, "search");
        assert_eq!(result.state, SelectionState::Found);
        assert_eq!(result.candidates, vec!["B"]);
    }

    #[test]
    fn test_maybe_all_lists_every_maybe_in_order() {
        let selector = create_test_selector(&[
            ("A", MatchOutcome::Maybe),
            ("B", MatchOutcome::NoMatch),
            ("C", MatchOutcome::Maybe),
        ]);
        let result = evaluate(&selector, "maybe=all");
        assert_eq!(result.state, SelectionState::Found);
        assert_eq!(result.platform.as_deref(), Some("A"));
        assert_eq!(result.candidates, vec!["A", "C"]);
        assert!(result.diagnostics.iter().any(|d| d == "found by maybe: A, C"));
    }

    #[test]
    fn test_maybe_none_ignores_maybes() {
        let selector = create_test_selector(&[("A", MatchOutcome::Maybe)]);
        let result = evaluate(&selector, "maybe=none,notfound=disabled");
        assert_eq!(result.state, SelectionState::NotFound);
        assert_eq!(result.into_outcome(), Err(SelectionError::NotFound));
    }

    #[test]
    fn test_notfound_enabled_yields_fallback() {
        let selector = create_test_selector(&[("A", MatchOutcome::NoMatch)]);
        let result = evaluate(&selector, "notfound=enabled");
        assert!(result.fallback);
        assert_eq!(result.candidates, vec![FALLBACK_PLATFORM]);
    }

    #[test]
    fn test_disabled_mode_selects_nothing() {
        let selector = create_test_selector(&[("A", MatchOutcome::Match)]);
        let result = evaluate(&selector, "disabled,notfound=enabled");
        assert_eq!(result.state, SelectionState::NotFound);
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn test_policy_parse_and_display() {
        let policy: Policy = "search,found=first,maybe=none,notfound=enabled".parse().unwrap();
        assert_eq!(policy.found, FoundPolicy::First);
        assert_eq!(policy.maybe, MaybePolicy::None);
        assert_eq!(policy.notfound, NotFoundPolicy::Enabled);
        assert_eq!(policy.to_string(), "search,found=first,maybe=none,notfound=enabled");
        assert_eq!("".parse::<Policy>().unwrap(), Policy::default());

        assert!("found=some".parse::<Policy>().is_err());
        assert!("report".parse::<Policy>().is_err());
        assert!("colour=blue".parse::<Policy>().is_err());
    }

    #[test]
    fn test_firmware_predicates() {
        let firmware = FakeFirmware::default()
            .with(FirmwareField::ProductName, "SmartDC HVM")
            .with(FirmwareField::ProductUuid, "EC2E1916-9099-7CAF-FD21-012345ABCDEF")
            .with(FirmwareField::ProductSerial, "ec2e1916-9099-7caf-fd21-012345abcdef");
        let devices = FakeDevices::default();
        let interfaces = FakeInterfaces::default();
        let clock = SystemClock::new();
        let ctx = DetectionContext::new(&firmware, &devices, &interfaces, &clock);

        assert!(Predicate::firmware_prefix(FirmwareField::ProductName, "smartdc", true).holds(&ctx));
        assert!(!Predicate::firmware_prefix(FirmwareField::ProductName, "smartdc", false).holds(&ctx));
        assert!(Predicate::firmware_suffix(FirmwareField::ProductName, "HVM", false).holds(&ctx));
        assert!(Predicate::FirmwareFieldsEqual(FirmwareField::ProductUuid, FirmwareField::ProductSerial).holds(&ctx));
        assert!(!Predicate::firmware_equals(FirmwareField::ChassisAssetTag, "x").holds(&ctx));
        assert!(Predicate::All(vec![
            Predicate::firmware_prefix(FirmwareField::ProductUuid, "ec2", true),
            Predicate::Any(vec![Predicate::FileExists("/nonexistent/bootmeta".into()), Predicate::Always]),
        ])
        .holds(&ctx));
        assert!(!Predicate::DeviceLabel("config-2".into()).holds(&ctx));
    }

    #[test]
    fn test_signature_stops_at_first_match() {
        let firmware = FakeFirmware::default().with(FirmwareField::SysVendor, "Amazon EC2");
        let devices = FakeDevices::default();
        let interfaces = FakeInterfaces::default();
        let clock = SystemClock::new();
        let ctx = DetectionContext::new(&firmware, &devices, &interfaces, &clock);

        let signature = PlatformSignature::new("Ec2")
            .check(Predicate::Always, MatchOutcome::Maybe)
            .check(Predicate::firmware_equals(FirmwareField::SysVendor, "Amazon EC2"), MatchOutcome::Match)
            .check(
                Predicate::VolumeMarker {
                    fstype: "iso9660".into(),
                    marker: "never-checked".into(),
                },
                MatchOutcome::Match,
            );
        assert_eq!(signature.evaluate(&ctx), MatchOutcome::Match);
        assert_eq!(devices.mounts.get(), 0);
    }
}
