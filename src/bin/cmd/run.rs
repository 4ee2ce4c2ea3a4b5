use clap::Args;

use ivee::backend::KvmBackend;
use ivee::{ArchState, Environment, ExecutableFormat};

fn parse_hex(s: &str) -> Result<u64, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| e.to_string())
}

/// Loads a flat binary into a fresh execution environment and calls it
/// once with the given general-purpose registers.
#[derive(Args)]
pub struct Cmd {
    /// Path to the flat binary image.
    #[arg(short, long)]
    pub file: String,

    #[arg(long, value_parser = parse_hex, default_value = "0")]
    pub rax: u64,
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    pub rbx: u64,
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    pub rcx: u64,
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    pub rdx: u64,
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    pub rsi: u64,
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    pub rdi: u64,
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    pub rbp: u64,
}

impl Cmd {
    pub fn execute(&self) -> ivee::Result<()> {
        let mut env = Environment::create(0, KvmBackend::new())?;
        env.load_executable(self.file.as_ref(), ExecutableFormat::Bin)?;

        let mut state = ArchState {
            rax: self.rax,
            rbx: self.rbx,
            rcx: self.rcx,
            rdx: self.rdx,
            rsi: self.rsi,
            rdi: self.rdi,
            rbp: self.rbp,
            ..Default::default()
        };

        env.call(&mut state)?;

        log::info!("guest call returned");
        println!("rax = {:#018x}", state.rax);
        println!("rbx = {:#018x}", state.rbx);
        println!("rcx = {:#018x}", state.rcx);
        println!("rdx = {:#018x}", state.rdx);

        Ok(())
    }
}
