//! Emergency-stop monitor: watches the enabled WhatsApp groups for a kill
//! token and shuts the managed monitor services down when one appears.

pub mod scan;
