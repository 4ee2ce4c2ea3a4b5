use bitflags::bitflags;

bitflags! {
    /// Host platform capabilities for execution environments.
    ///
    /// A supported hypervisor is a hard requirement, not a capability -
    /// it is never listed here. Currently no capability bit is actually
    /// supported; [`Capabilities::supported`] always returns empty, so
    /// `create` rejects any caller-requested bit.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Capabilities: u64 {
        /// Platform can provide manual management of environment page faults.
        const PAGE_FAULT_HANDLING = 0x0001;
        /// Platform can transparently encrypt environment memory with a key
        /// unavailable to the hypervisor or monitor.
        const MEMORY_ENCRYPTION = 0x0002;
    }
}

impl Capabilities {
    /// Capabilities this implementation actually supports.
    pub fn supported() -> Capabilities {
        Capabilities::empty()
    }
}
