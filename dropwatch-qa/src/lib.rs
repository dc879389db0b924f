//! QA feedback monitor: scans the sheet mirror for reviews marked
//! incomplete and sends field agents a list of the outstanding checklist
//! steps, plus a WhatsApp scan for resubmission announcements.

pub mod feedback;
pub mod resubmission;
