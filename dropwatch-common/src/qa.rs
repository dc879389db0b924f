//! QA photo-checklist model
//!
//! Every installation is reviewed against a fixed, ordered checklist of 14
//! photo steps. A review carries three derived flags: `incomplete` (reviewer
//! found at least one step missing), `resubmitted` (agent re-posted updated
//! material) and `completed` (all steps accepted). `completed` and
//! `incomplete` are mutually exclusive by construction.

use serde::{Deserialize, Serialize};

/// Number of checklist steps per review.
pub const STEP_COUNT: usize = 14;

/// Database column names for the step booleans, in step order.
pub const STEP_COLUMNS: [&str; STEP_COUNT] = [
    "step_01_property_frontage",
    "step_02_location_before_install",
    "step_03_outside_cable_span",
    "step_04_home_entry_outside",
    "step_05_home_entry_inside",
    "step_06_fibre_entry_to_ont",
    "step_07_patched_labelled_drop",
    "step_08_work_area_completion",
    "step_09_ont_barcode_scan",
    "step_10_ups_serial_number",
    "step_11_powermeter_reading",
    "step_12_powermeter_at_ont",
    "step_13_active_broadband_light",
    "step_14_customer_signature",
];

/// Human-readable step labels used in feedback messages, in step order.
pub const STEP_LABELS: [&str; STEP_COUNT] = [
    "1. Property Frontage Photo",
    "2. Location Before Installation",
    "3. Outside Cable Span",
    "4. Home Entry Outside",
    "5. Home Entry Inside",
    "6. Fibre Entry to ONT",
    "7. Patched & Labelled Drop",
    "8. Work Area Completion",
    "9. ONT Barcode Scan",
    "10. UPS Serial Number",
    "11. Power Meter Reading",
    "12. Power Meter at ONT",
    "13. Active Broadband Light",
    "14. Customer Signature",
];

/// The 14 step booleans of one review, in step order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistSteps(pub [bool; STEP_COUNT]);

impl ChecklistSteps {
    /// A fresh review: nothing accepted yet.
    pub fn all_false() -> Self {
        Self([false; STEP_COUNT])
    }

    pub fn all_complete(&self) -> bool {
        self.0.iter().all(|&step| step)
    }

    /// Human-readable labels of the steps still missing, in step order.
    /// An empty list means there is nothing to communicate.
    pub fn missing_steps(&self) -> Vec<&'static str> {
        self.0
            .iter()
            .zip(STEP_LABELS.iter())
            .filter(|(&done, _)| !done)
            .map(|(_, &label)| label)
            .collect()
    }
}

/// Review lifecycle flags, kept consistent through the transition methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFlags {
    pub incomplete: bool,
    pub resubmitted: bool,
    pub completed: bool,
}

impl ReviewFlags {
    /// Derive flags from a step vector: completion wins over incompleteness,
    /// so `completed && incomplete` is unreachable.
    pub fn derive(steps: &ChecklistSteps, reviewer_marked_incomplete: bool) -> Self {
        if steps.all_complete() {
            Self {
                incomplete: false,
                resubmitted: false,
                completed: true,
            }
        } else {
            Self {
                incomplete: reviewer_marked_incomplete,
                resubmitted: false,
                completed: false,
            }
        }
    }

    /// Agent resubmitted updated material: clear the incomplete flag and
    /// begin a fresh review cycle. The feedback stamp is reset by the store
    /// alongside this transition so the next incomplete verdict notifies
    /// again.
    pub fn apply_resubmission(&mut self) {
        self.incomplete = false;
        self.resubmitted = true;
        self.completed = false;
    }

    /// Review needs feedback when the reviewer flagged it incomplete and it
    /// has not been completed since.
    pub fn needs_feedback(&self) -> bool {
        self.incomplete && !self.completed
    }
}
