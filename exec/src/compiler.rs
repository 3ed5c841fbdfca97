use std::sync::Arc;

use tracing::{debug, warn};
use xlat_backend::x86_64::emitter::emit_jcc_fixup;
use xlat_backend::{
    emit_prologue, AbiBridge, BackpatchRegistry, CallArg, CallSite, CallTarget, CodeBuffer,
    ExecRegion, Exit, ExitGen, Helper, HostAbi, RegisterBindingPlan, X86Cond, STANDARD_PLAN,
};
use xlat_core::{ExitDescriptor, RecoveryRecord, Result, XlatConfig, XlatError};

use crate::block::TranslatedBlock;
use crate::cache::TranslationCache;
use crate::{GuestTranslator, InsnFlow};

/// Emission state handed to the guest layer for one instruction.
pub struct BlockContext<'a> {
    buf: &'a mut CodeBuffer,
    registry: &'a mut BackpatchRegistry,
    exits: ExitGen<'a>,
    descriptors: Vec<ExitDescriptor>,
    pc: u32,
    icount: u32,
    terminated: bool,
}

impl<'a> BlockContext<'a> {
    fn new(buf: &'a mut CodeBuffer, registry: &'a mut BackpatchRegistry, exits: ExitGen<'a>) -> Self {
        Self {
            buf,
            registry,
            pc: exits.block_start,
            exits,
            descriptors: Vec::new(),
            icount: 0,
            terminated: false,
        }
    }

    /// Raw emitter for code the guest layer writes itself.
    pub fn buf(&mut self) -> &mut CodeBuffer {
        assert!(!self.terminated, "emission after the block exit");
        self.buf
    }

    pub fn plan(&self) -> &'static RegisterBindingPlan {
        &STANDARD_PLAN
    }

    pub fn bridge(&self) -> AbiBridge {
        self.exits.bridge
    }

    /// Guest PC of the instruction being translated.
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Instructions completed before the current one.
    pub fn icount(&self) -> u32 {
        self.icount
    }

    pub fn block_start(&self) -> u32 {
        self.exits.block_start
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn call(&mut self, target: CallTarget, args: &[CallArg]) -> CallSite {
        let bridge = self.bridge();
        bridge.call(self.buf(), target, args)
    }

    pub fn call_helper(&mut self, helper: Helper, arg: Option<CallArg>) -> CallSite {
        let bridge = self.bridge();
        bridge.call_helper(self.buf(), helper, arg)
    }

    /// Exception-enabled call; see [`AbiBridge::call_exc`].
    pub fn call_exc(&mut self, target: CallTarget, args: &[CallArg]) -> CallSite {
        assert!(!self.terminated, "emission after the block exit");
        let bridge = self.bridge();
        bridge.call_exc(self.buf, self.registry, target, args, self.icount)
    }

    /// Raise guest exception `code` at this instruction when `cond`
    /// holds after the preceding compare.
    pub fn guard(&mut self, cond: X86Cond, code: u32) {
        assert!(!self.terminated, "emission after the block exit");
        self.registry.add_guard(self.buf, cond, code, self.icount);
    }

    /// Terminate the block.
    pub fn exit(&mut self, exit: Exit) {
        let exits = self.exits;
        let desc = exits.emit(self.buf(), exit);
        self.descriptors.push(desc);
        self.terminated = true;
    }

    /// Take `exit` when `cond` holds; otherwise fall through.
    pub fn exit_if(&mut self, cond: X86Cond, exit: Exit) {
        let skip = emit_jcc_fixup(self.buf(), cond.invert());
        let desc = self.exits.emit(self.buf, exit);
        self.buf.bind_rel32(skip);
        self.descriptors.push(desc);
    }

    fn advance(&mut self, next_pc: u32) {
        self.pc = next_pc;
        self.icount += 1;
    }
}

/// Turns guest code into [`TranslatedBlock`]s.
///
/// Each compiler owns its emission arena, so concurrent compilation
/// needs one compiler per thread; all of them may share one cache.
pub struct BlockCompiler {
    config: XlatConfig,
    cache: Arc<TranslationCache>,
    bridge: AbiBridge,
    buf: CodeBuffer,
}

impl BlockCompiler {
    pub fn new(config: XlatConfig, cache: Arc<TranslationCache>) -> Result<Self> {
        config.validate()?;
        let buf = CodeBuffer::new(config.code_capacity);
        Ok(Self {
            config,
            cache,
            bridge: AbiBridge::native(),
            buf,
        })
    }

    pub fn config(&self) -> &XlatConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    /// Compile the block starting at `start_pc` and publish it.
    pub fn compile<G: GuestTranslator + ?Sized>(
        &mut self,
        guest: &mut G,
        start_pc: u32,
    ) -> Result<Arc<TranslatedBlock>> {
        let width = guest.insn_width();
        assert!(width.is_power_of_two(), "instruction width must be a power of two");

        let exits = ExitGen {
            bridge: self.bridge,
            plan: &STANDARD_PLAN,
            block_start: start_pc,
            insn_shift: width.trailing_zeros() as u8,
            cycle_period: guest.cycle_period(),
            window: self.cache.icache().window(),
            resolve: guest
                .resolve_virtual()
                .unwrap_or_else(|| self.cache.resolve_helper()),
            raise: guest.raise_exception(),
        };

        self.buf.reset();
        // Blocks are entered from Rust, so the prologue follows the
        // native convention.
        emit_prologue(&mut self.buf, HostAbi::native());

        let mut registry = BackpatchRegistry::new();
        let mut recovery = Vec::new();
        let mut ctx = BlockContext::new(&mut self.buf, &mut registry, exits);
        let mut pc = start_pc;
        loop {
            recovery.push(RecoveryRecord {
                host_offset: ctx.buf.offset() as u32,
                icount: ctx.icount,
            });
            let flow = guest.translate_insn(&mut ctx, pc);
            pc = pc.wrapping_add(width);
            ctx.advance(pc);
            if ctx.buf.is_exhausted() {
                break;
            }
            if ctx.terminated || flow == InsnFlow::Stop || ctx.icount >= self.config.max_block_insns {
                break;
            }
        }
        if !ctx.terminated && !ctx.buf.is_exhausted() {
            ctx.exit(Exit::Rel { pc, endpc: pc });
        }
        let icount = ctx.icount;
        let descriptors = std::mem::take(&mut ctx.descriptors);

        let finalized = registry.finalize(&mut self.buf, &exits);
        if self.buf.is_exhausted() {
            warn!(
                pc = start_pc,
                capacity = self.config.code_capacity,
                "code buffer exhausted, block discarded"
            );
            return Err(XlatError::CompileCapacityExceeded {
                pc: start_pc,
                capacity: self.config.code_capacity,
            });
        }
        assert_eq!(self.buf.pending_fixups(), 0, "unpatched fixups in finished block");

        if !self.cache.has_room(self.buf.offset()) {
            warn!(
                pc = start_pc,
                used = self.cache.used_bytes(),
                capacity = self.cache.capacity(),
                "translation cache full"
            );
            return Err(XlatError::CompileCapacityExceeded {
                pc: start_pc,
                capacity: self.cache.capacity(),
            });
        }

        let code = ExecRegion::install(self.buf.as_slice(), self.buf.relocations())?;
        let block = Arc::new(TranslatedBlock {
            guest_start_pc: start_pc,
            guest_end_pc: pc,
            icount,
            code,
            backpatch_list: finalized.sites,
            exits: descriptors,
            trampolines: finalized.trampolines,
            recovery,
            insn_shift: exits.insn_shift,
        });
        debug!(
            pc = start_pc,
            insns = icount,
            host_size = block.code_size(),
            sites = block.backpatch_list.len(),
            "compiled block"
        );
        self.cache.insert(Arc::clone(&block));
        Ok(block)
    }
}
