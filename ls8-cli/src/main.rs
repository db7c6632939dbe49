use std::io::Write;
use std::path::PathBuf;

use ls8::{Cpu, Device};

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;

mod load;

/// LS-8 program runner
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Program to load and execute
    program: PathBuf,

    /// Log the machine state before each instruction
    #[clap(long)]
    trace: bool,
}

/// Console device, writing one decimal value per line
struct Console<W> {
    out: W,
}

impl<W: Write> Device for Console<W> {
    fn print(&mut self, value: u8) {
        writeln!(self.out, "{value}").unwrap();
        self.out.flush().unwrap();
    }
}

/// Logs the PC, the three bytes at it, and the register file
fn trace(cpu: &Cpu) {
    let pc = cpu.pc();
    let regs = cpu
        .regs()
        .iter()
        .map(|r| format!("{r:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    debug!(
        "{pc:02x} | {:02x} {:02x} {:02x} | {regs}",
        cpu.ram_read(pc),
        cpu.ram_read(pc.wrapping_add(1)),
        cpu.ram_read(pc.wrapping_add(2)),
    );
}

fn main() -> Result<()> {
    let env = env_logger::Env::default()
        .filter_or("LS8_LOG", "info")
        .write_style_or("LS8_LOG", "always");
    env_logger::init_from_env(env);

    let args = Args::parse();
    let text = std::fs::read_to_string(&args.program)
        .with_context(|| format!("failed to read {:?}", args.program))?;
    let program = load::parse(&text)
        .with_context(|| format!("failed to load {:?}", args.program))?;

    let mut cpu = Cpu::new(&program);
    let mut con = Console {
        out: std::io::stdout().lock(),
    };
    if args.trace {
        loop {
            trace(&cpu);
            if cpu.step(&mut con)? {
                break;
            }
        }
    } else {
        cpu.run(&mut con)?;
    }

    Ok(())
}
