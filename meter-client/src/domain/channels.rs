use std::ops::Index;

/// Number of numeric channels retained from a sensor payload.
pub const CHANNEL_COUNT: usize = 14;

/// Retained sensor fields, in day-file and table column order.
pub const CHANNEL_NAMES: [&str; CHANNEL_COUNT] = [
    "total_power_import_kwh",
    "total_power_export_kwh",
    "active_power_w",
    "active_power_l1_w",
    "active_power_l2_w",
    "active_power_l3_w",
    "active_voltage_v",
    "active_voltage_l1_v",
    "active_voltage_l2_v",
    "active_voltage_l3_v",
    "active_current_a",
    "active_current_l1_a",
    "active_current_l2_a",
    "active_current_l3_a",
];

/// Position of `active_power_w` in [`CHANNEL_NAMES`].
pub const ACTIVE_POWER: usize = 2;

/// One value per retained channel; `None` when the sensor did not report it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelValues([Option<f64>; CHANNEL_COUNT]);

impl ChannelValues {
    pub fn new(values: [Option<f64>; CHANNEL_COUNT]) -> Self {
        Self(values)
    }

    /// All channels null.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn index_of(name: &str) -> Option<usize> {
        CHANNEL_NAMES.iter().position(|c| *c == name)
    }

    /// Sets a channel by name; unknown names are ignored and reported as `false`.
    pub fn set(&mut self, name: &str, value: f64) -> bool {
        match Self::index_of(name) {
            Some(idx) => {
                self.0[idx] = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, idx: usize) -> Option<f64> {
        self.0.get(idx).copied().flatten()
    }

    pub fn active_power(&self) -> Option<f64> {
        self.0[ACTIVE_POWER]
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<f64>> + '_ {
        self.0.iter().copied()
    }
}

impl Index<usize> for ChannelValues {
    type Output = Option<f64>;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.0[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_power_index_matches_name() {
        assert_eq!(CHANNEL_NAMES[ACTIVE_POWER], "active_power_w");
    }

    #[test]
    fn set_ignores_unknown_fields() {
        let mut v = ChannelValues::empty();
        assert!(v.set("active_power_w", 120.5));
        assert!(!v.set("wifi_strength", 80.0));
        assert_eq!(v.active_power(), Some(120.5));
        assert!(!v.is_empty());
    }
}
