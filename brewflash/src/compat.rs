//! Settings compatibility between firmware versions.
//!
//! Firmware releases rename, drop and add configuration keys. For every
//! supported (old, new) version pair there is a table listing, for each key
//! of the new firmware, the old keys that carry the same meaning. Tables are
//! static data; picking one is a pure function of the two versions, so the
//! restoration plan can be computed and tested without a device.

use {
    crate::{snapshot::SettingsMap, version::FirmwareVersion},
    std::fmt,
};

/// One new key and the old keys that may supply its value, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasEntry {
    /// Key as named by the new firmware.
    pub key: &'static str,
    /// Old key names, in priority order.
    pub aliases: &'static [&'static str],
}

const fn same(key: &'static str, aliases: &'static [&'static str]) -> AliasEntry {
    AliasEntry { key, aliases }
}

/// Mapping from new-firmware keys to old-firmware keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityTable {
    /// Every key maps to the identically named old key.
    All,
    /// Explicit alias table.
    Aliases {
        /// Table name for log output.
        name: &'static str,
        /// Alias entries, grouped as the tables are assembled.
        parts: &'static [&'static [AliasEntry]],
    },
}

impl CompatibilityTable {
    /// Table that restores nothing.
    pub const EMPTY: Self = Self::Aliases {
        name: "none",
        parts: &[],
    };

    /// Table name for log output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Aliases { name, .. } => name,
        }
    }

    /// Old-key aliases declared for `new_key`.
    pub fn aliases(&self, new_key: &str) -> &'static [&'static str] {
        match self {
            Self::All => &[],
            Self::Aliases { parts, .. } => parts
                .iter()
                .flat_map(|part| part.iter())
                .find(|e| e.key == new_key)
                .map_or(&[], |e| e.aliases),
        }
    }

    /// Resolve a new key to the old key that supplies its value.
    ///
    /// Returns `None` when no alias is present in `old`; the new firmware's
    /// default then stays in effect.
    pub fn resolve<'a>(&self, new_key: &'a str, old: &SettingsMap) -> Option<&'a str> {
        match self {
            Self::All => old
                .contains_key(new_key)
                .then_some(new_key),
            Self::Aliases { .. } => self
                .aliases(new_key)
                .iter()
                .copied()
                .find(|alias| old.contains_key(*alias)),
        }
    }
}

impl fmt::Display for CompatibilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What can be carried across a particular version change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    /// Table used to map settings.
    pub table: CompatibilityTable,
    /// Whether settings may be restored at all.
    pub settings: bool,
    /// Whether installed devices may be restored.
    pub devices: bool,
    /// Human-readable explanation.
    pub note: &'static str,
}

/// Pick the restoration plan for an update from `old` to `new`.
pub fn select_plan(old: &FirmwareVersion, new: &FirmwareVersion) -> RestorePlan {
    let plan = |table, settings, devices, note| RestorePlan {
        table,
        settings,
        devices,
        note,
    };

    if old == new {
        return plan(
            CompatibilityTable::All,
            true,
            true,
            "new version is equal to old version, restoring all settings",
        );
    }

    if new.major != 0 || new.minor != 2 {
        return plan(
            CompatibilityTable::EMPTY,
            false,
            false,
            "settings can only be restored when updating to 0.2.0 or higher",
        );
    }

    match (old.major, old.minor) {
        (0, 0) => plan(
            CompatibilityTable::EMPTY,
            false,
            false,
            "old firmware predates versioned settings, resetting to defaults",
        ),
        (0, 1) => plan(
            KEYS_0_1_X_TO_0_2_X,
            true,
            false,
            "settings can only be partially restored when going from 0.1.x to 0.2.x",
        ),
        (0, 2) => {
            let table = match new.revision {
                0 => KEYS_0_2_X_TO_0_2_0,
                1 => KEYS_0_2_X_TO_0_2_1,
                2 => KEYS_0_2_X_TO_0_2_2,
                3 => KEYS_0_2_X_TO_0_2_3,
                4 if old.revision >= 3 => KEYS_0_2_3_TO_0_2_4,
                4 => KEYS_0_2_X_TO_0_2_4,
                _ => CompatibilityTable::EMPTY,
            };
            plan(table, true, true, "will try to restore compatible settings")
        },
        _ => plan(
            CompatibilityTable::EMPTY,
            false,
            false,
            "no compatibility table for this version pair",
        ),
    }
}

/// Order in which restored keys are written.
///
/// The temperature format goes first so later temperatures are interpreted
/// in the right unit; the mode goes last so the controller does not start
/// acting on half-restored settings.
pub const RESTORE_ORDER: &[&str] = &[
    "tempFormat",
    "tempSetMin",
    "tempSetMax",
    "Kp",
    "Ki",
    "Kd",
    "iMaxErr",
    "idleRangeH",
    "idleRangeL",
    "heatTargetH",
    "heatTargetL",
    "coolTargetH",
    "coolTargetL",
    "maxHeatTimeForEst",
    "maxCoolTimeForEst",
    "fridgeFastFilt",
    "fridgeSlowFilt",
    "fridgeSlopeFilt",
    "beerFastFilt",
    "beerSlowFilt",
    "beerSlopeFilt",
    "lah",
    "hs",
    "pidMax",
    "heatEst",
    "coolEst",
    "fridgeSet",
    "beerSet",
    "mode",
];

/// Sort keys into write order: [`RESTORE_ORDER`] first, the rest alphabetically.
pub fn restore_order<'a>(keys: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut keys: Vec<&str> = keys
        .into_iter()
        .collect();
    keys.sort_by_key(|k| {
        (
            RESTORE_ORDER
                .iter()
                .position(|o| o == k)
                .unwrap_or(RESTORE_ORDER.len()),
            *k,
        )
    });
    keys.dedup();
    keys
}

// Tables

const SETTINGS_0_2: &[AliasEntry] = &[
    same("mode", &["mode"]),
    same("beerSet", &["beerSet"]),
    same("fridgeSet", &["fridgeSet"]),
    same("heatEst", &["heatEst"]),
    same("coolEst", &["coolEst"]),
];

const CONSTANTS_0_2_BASE: &[AliasEntry] = &[
    same("tempFormat", &["tempFormat"]),
    same("tempSetMin", &["tempSetMin"]),
    same("tempSetMax", &["tempSetMax"]),
    same("pidMax", &["pidMax"]),
    same("Kp", &["Kp"]),
    same("Ki", &["Ki"]),
    same("Kd", &["Kd"]),
    same("iMaxErr", &["iMaxErr"]),
    same("idleRangeH", &["idleRangeH"]),
    same("idleRangeL", &["idleRangeL"]),
    same("heatTargetH", &["heatTargetH"]),
    same("heatTargetL", &["heatTargetL"]),
    same("coolTargetH", &["coolTargetH"]),
    same("coolTargetL", &["coolTargetL"]),
    same("maxHeatTimeForEst", &["maxHeatTimeForEst"]),
    same("maxCoolTimeForEst", &["maxCoolTimeForEst"]),
];

const FILTERS_0_2: &[AliasEntry] = &[
    same("fridgeFastFilt", &["fridgeFastFilt"]),
    same("fridgeSlowFilt", &["fridgeSlowFilt"]),
    same("fridgeSlopeFilt", &["fridgeSlopeFilt"]),
    same("beerFastFilt", &["beerFastFilt"]),
    same("beerSlowFilt", &["beerSlowFilt"]),
    same("beerSlopeFilt", &["beerSlopeFilt"]),
];

macro_rules! table {
    ($name:literal: $($part:expr),+ $(,)?) => {
        CompatibilityTable::Aliases {
            name: $name,
            parts: &[$($part),+],
        }
    };
}

/// 0.1.x used long names for most constants and had no light-as-heater or
/// heating-switch options.
pub const KEYS_0_1_X_TO_0_2_X: CompatibilityTable = table!("0.1.x->0.2.x":
    SETTINGS_0_2,
    &[
        same("tempFormat", &["tempFormat"]),
        same("tempSetMin", &["tempSetMin"]),
        same("tempSetMax", &["tempSetMax"]),
        same("pidMax", &["pidMax"]),
        same("Kp", &["Kp"]),
        same("Ki", &["Ki"]),
        same("Kd", &["Kd"]),
        same("iMaxErr", &["iMaxErr", "iMaxError"]),
        same("idleRangeH", &["idleRangeH", "idleRangeHigh"]),
        same("idleRangeL", &["idleRangeL", "idleRangeLow"]),
        same("heatTargetH", &["heatTargetH", "heatingTargetUpper"]),
        same("heatTargetL", &["heatTargetL", "heatingTargetLower"]),
        same("coolTargetH", &["coolTargetH", "coolingTargetUpper"]),
        same("coolTargetL", &["coolTargetL", "coolingTargetLower"]),
        same("maxHeatTimeForEst", &["maxHeatTimeForEst", "maxHeatTimeForEstimate"]),
        same("maxCoolTimeForEst", &["maxCoolTimeForEst", "maxCoolTimeForEstimate"]),
    ],
    FILTERS_0_2,
);

/// Target 0.2.0.
pub const KEYS_0_2_X_TO_0_2_0: CompatibilityTable =
    table!("0.2.x->0.2.0": SETTINGS_0_2, CONSTANTS_0_2_BASE, FILTERS_0_2);

/// Target 0.2.1 (adds light-as-heater).
pub const KEYS_0_2_X_TO_0_2_1: CompatibilityTable = table!("0.2.x->0.2.1":
    SETTINGS_0_2,
    CONSTANTS_0_2_BASE,
    FILTERS_0_2,
    &[same("lah", &["lah"])],
);

/// Target 0.2.2 (adds heating switch).
pub const KEYS_0_2_X_TO_0_2_2: CompatibilityTable = table!("0.2.x->0.2.2":
    SETTINGS_0_2,
    CONSTANTS_0_2_BASE,
    FILTERS_0_2,
    &[same("lah", &["lah"]), same("hs", &["hs"])],
);

/// Target 0.2.3.
pub const KEYS_0_2_X_TO_0_2_3: CompatibilityTable = table!("0.2.x->0.2.3":
    SETTINGS_0_2,
    CONSTANTS_0_2_BASE,
    FILTERS_0_2,
    &[same("lah", &["lah"]), same("hs", &["hs"])],
);

/// Target 0.2.4 from before 0.2.3: the filter implementation changed in
/// 0.2.3, so older filter coefficients are not carried over.
pub const KEYS_0_2_X_TO_0_2_4: CompatibilityTable = table!("0.2.x->0.2.4":
    SETTINGS_0_2,
    CONSTANTS_0_2_BASE,
    &[same("lah", &["lah"]), same("hs", &["hs"])],
);

/// Target 0.2.4 from 0.2.3 or later.
pub const KEYS_0_2_3_TO_0_2_4: CompatibilityTable = table!("0.2.3->0.2.4":
    SETTINGS_0_2,
    CONSTANTS_0_2_BASE,
    FILTERS_0_2,
    &[same("lah", &["lah"]), same("hs", &["hs"])],
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(s: &str) -> FirmwareVersion {
        s.parse().unwrap()
    }

    fn map(value: serde_json::Value) -> SettingsMap {
        match value {
            serde_json::Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_resolve_all_returns_same_key() {
        let old = map(json!({"Kp": 20, "mode": "b"}));
        for key in ["Kp", "mode"] {
            assert_eq!(CompatibilityTable::All.resolve(key, &old), Some(key));
        }
        assert_eq!(CompatibilityTable::All.resolve("hs", &old), None);
    }

    #[test]
    fn test_resolve_first_present_alias_wins() {
        let old = map(json!({"idleRangeHigh": 1.0, "idleRangeH": 2.0}));
        assert_eq!(
            KEYS_0_1_X_TO_0_2_X.resolve("idleRangeH", &old),
            Some("idleRangeH")
        );

        let old = map(json!({"idleRangeHigh": 1.0}));
        assert_eq!(
            KEYS_0_1_X_TO_0_2_X.resolve("idleRangeH", &old),
            Some("idleRangeHigh")
        );
    }

    #[test]
    fn test_resolve_missing_alias_is_none() {
        let old = map(json!({"Kp": 5}));
        assert_eq!(KEYS_0_2_X_TO_0_2_3.resolve("hs", &old), None);
        assert_eq!(KEYS_0_2_X_TO_0_2_3.resolve("unknownKey", &old), None);
        assert_eq!(CompatibilityTable::EMPTY.resolve("Kp", &old), None);
    }

    #[test]
    fn test_tables_are_flattened() {
        assert_eq!(KEYS_0_2_X_TO_0_2_0.aliases("mode"), &["mode"]);
        assert_eq!(KEYS_0_2_X_TO_0_2_0.aliases("beerSlopeFilt"), &["beerSlopeFilt"]);
        assert!(KEYS_0_2_X_TO_0_2_0.aliases("lah").is_empty());
        assert_eq!(KEYS_0_2_X_TO_0_2_2.aliases("hs"), &["hs"]);
        assert!(KEYS_0_2_X_TO_0_2_4.aliases("beerFastFilt").is_empty());
        assert_eq!(KEYS_0_2_3_TO_0_2_4.aliases("beerFastFilt"), &["beerFastFilt"]);
    }

    #[test]
    fn test_select_plan_equal_versions() {
        let plan = select_plan(&v("0.2.4"), &v("0.2.4"));
        assert_eq!(plan.table, CompatibilityTable::All);
        assert!(plan.settings && plan.devices);
    }

    #[test]
    fn test_select_plan_0_2_revisions() {
        let cases = [
            ("0.2.1", "0.2.0", "0.2.x->0.2.0"),
            ("0.2.0", "0.2.1", "0.2.x->0.2.1"),
            ("0.2.0", "0.2.2", "0.2.x->0.2.2"),
            ("0.2.2", "0.2.3", "0.2.x->0.2.3"),
            ("0.2.2", "0.2.4", "0.2.x->0.2.4"),
            ("0.2.3", "0.2.4", "0.2.3->0.2.4"),
            ("0.2.3", "0.2.9", "none"),
        ];
        for (old, new, expected) in cases {
            let plan = select_plan(&v(old), &v(new));
            assert_eq!(plan.table.name(), expected, "{old} -> {new}");
            assert!(plan.settings);
            assert!(plan.devices);
        }
    }

    #[test]
    fn test_select_plan_from_0_1_disables_devices() {
        let plan = select_plan(&v("0.1.5"), &v("0.2.3"));
        assert_eq!(plan.table, KEYS_0_1_X_TO_0_2_X);
        assert!(plan.settings);
        assert!(!plan.devices);
    }

    #[test]
    fn test_select_plan_unsupported_pairs() {
        for (old, new) in [("0.0.9", "0.2.3"), ("1.0.0", "0.2.3"), ("0.2.3", "0.3.0")] {
            let plan = select_plan(&v(old), &v(new));
            assert_eq!(plan.table, CompatibilityTable::EMPTY, "{old} -> {new}");
            assert!(!plan.settings && !plan.devices);
        }
    }

    #[test]
    fn test_restore_order() {
        let ordered = restore_order(["mode", "zeta", "Kp", "tempFormat", "alpha"]);
        assert_eq!(ordered, vec!["tempFormat", "Kp", "mode", "alpha", "zeta"]);
    }
}
