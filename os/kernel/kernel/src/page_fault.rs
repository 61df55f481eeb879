//! # Page-Fault Error Code
//!
//! The CPU pushes this word along with every `#PF`; `cr2` holds the address.
//! See Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".

use bitfield_struct::bitfield;

#[bitfield(u64)]
pub struct PageFaultError {
    /// Clear: the page was not present. Set: the access was not permitted.
    pub present: bool,
    /// The access was a write.
    pub write: bool,
    /// The access came from ring 3.
    pub user: bool,
    /// A paging structure had a reserved bit set.
    pub reserved_bit: bool,
    /// The access was an instruction fetch.
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    /// One line describing the fault for the log.
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "reserved bit set in a page-table entry"
        } else if !self.present() {
            if self.user() {
                "user access to a non-present page"
            } else {
                "kernel access to a non-present page"
            }
        } else if self.instruction_fetch() {
            "instruction fetch from a no-execute page"
        } else if self.write() {
            "write to a read-only page"
        } else if self.user() {
            "user read of a supervisor page"
        } else {
            "protection violation"
        }
    }
}
