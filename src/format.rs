/// Supported executable file formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutableFormat {
    /// Flat binary image without a header, entry point at offset 0.
    Bin,
    /// Let the implementation guess the format. No probing logic is
    /// implemented; this currently behaves identically to `Bin`.
    Any,
}
