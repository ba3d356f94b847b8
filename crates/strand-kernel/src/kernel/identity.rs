//! Identity types for strands and workers.
//!
//! A root strand's id doubles as the primary key of the domain object it
//! manages (the subnet, the NIC, ...). Child strands get fresh ids and name
//! their domain object through the frame's `subject_id`.

use uuid::Uuid;

/// Identifies one strand. Shared with the managed domain object for root strands.
pub type StrandId = Uuid;

/// Identifies a worker holding (or trying to hold) leases.
pub type WorkerId = String;

/// Allocates a fresh strand id.
pub fn new_strand_id() -> StrandId {
    Uuid::new_v4()
}
