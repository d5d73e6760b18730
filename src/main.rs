//! oxidized-ppu runner
//!
//! Loads a flat big-endian PPU image at the executable base, compiles it
//! when the recompiler is selected, and runs it from the first instruction
//! until it returns.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use oc_core::config::{Config, PpuDecoderType};
use oc_jit::Recompiler;
use oc_memory::constants::EXECUTABLE_BASE;
use oc_memory::MemoryManager;
use oc_ppu::thread::RETURN_SENTINEL;
use oc_ppu::{
    CommandInbox, ExecTable, Gateway, GlobalSuspend, GuestModule, NullKernel, PpuInterpreter, PpuRunner, PpuThread,
    ReservationUnit,
};

const MEMORY_SIZE: u32 = 0x0100_0000;
const STACK_SIZE: u32 = 0x0001_0000;
const STACK_ADDR: u32 = MEMORY_SIZE - STACK_SIZE;

fn parse_decoder(name: &str) -> Result<PpuDecoderType> {
    Ok(match name {
        "interpreter" => PpuDecoderType::Interpreter,
        "precise" => PpuDecoderType::InterpreterPrecise,
        "recompiler" => PpuDecoderType::Recompiler,
        other => bail!("unknown decoder '{}'", other),
    })
}

fn main() -> Result<()> {
    let mut config = Config::load().unwrap_or_default();
    oc_core::logging::init(&config);

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <flat-image> [interpreter|precise|recompiler]", args[0]);
        std::process::exit(1);
    }
    let path = PathBuf::from(&args[1]);
    if let Some(decoder) = args.get(2) {
        config.cpu.ppu_decoder = parse_decoder(decoder)?;
    }

    let image = std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    if image.len() as u64 > (STACK_ADDR - EXECUTABLE_BASE) as u64 {
        bail!("{} does not fit below the stack", path.display());
    }
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let module = GuestModule::from_flat_image(name, EXECUTABLE_BASE, image);

    let memory = MemoryManager::with_main_memory(MEMORY_SIZE).context("failed to map main memory")?;
    module.load(&memory).context("failed to load image")?;
    let table = Arc::new(ExecTable::new(0, MEMORY_SIZE));
    for segment in &module.segments {
        table.register_segment(&memory, segment.addr, segment.size)?;
    }
    tracing::info!("Loaded {} ({} bytes) at 0x{:08x}", module.name, module.code_size(), module.entry);

    if config.cpu.ppu_decoder == PpuDecoderType::Recompiler {
        let recompiler = Recompiler::new(&config, table.clone());
        recompiler
            .compile_module(&module)
            .with_context(|| format!("failed to compile {}", module.name))?;
        let stats = recompiler.stats();
        tracing::info!(
            "Recompiler: {} chunks compiled, {} cached, {} functions linked",
            stats.compiled,
            stats.cache_hits,
            stats.linked
        );
    }

    let suspend = Arc::new(GlobalSuspend::new());
    let interp = Arc::new(PpuInterpreter::new(
        memory.clone(),
        table,
        Arc::new(ReservationUnit::new(&config.cpu, suspend.clone())),
        Arc::new(NullKernel::new()),
        &config.cpu,
    ));
    let gateway = Arc::new(Gateway::new(interp, suspend, &config.cpu));

    let mut thread = PpuThread::new(0, memory).with_stack(STACK_ADDR, STACK_SIZE);
    thread.set_pc(module.entry as u64);
    thread.regs.lr = RETURN_SENTINEL;
    let (_commands, inbox) = CommandInbox::for_thread(&thread, config.cpu.command_capacity);
    let runner = PpuRunner::new(gateway, inbox);

    let reason = runner.run(&mut thread)?;
    println!("exit: {:?}", reason);
    println!("pc  = 0x{:08x}", thread.pc());
    println!("lr  = 0x{:016x}  ctr = 0x{:016x}  cr = 0x{:08x}", thread.regs.lr, thread.regs.ctr, thread.regs.cr);
    for row in 0..8 {
        let regs: Vec<String> = (0..4)
            .map(|col| {
                let reg = row * 4 + col;
                format!("r{:<2} = 0x{:016x}", reg, thread.gpr(reg))
            })
            .collect();
        println!("{}", regs.join("  "));
    }
    Ok(())
}
