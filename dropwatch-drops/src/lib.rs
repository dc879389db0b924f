//! Drop reconciler: tails the WhatsApp message mirror, extracts drop
//! numbers, and reconciles them against the installation registry and the
//! project sheet mirror.

pub mod cycle;
