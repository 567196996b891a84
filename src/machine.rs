//! An in-memory machine implementing the kernel primitives.
//!
//! The protocol modules consume the kernel through [`EnvServices`]; this
//! module provides the concrete implementation backing the test suite and
//! the kernel monitor. It models exactly what the protocol needs from the
//! machine and no more: a pool of 4 KiB frames with byte contents and
//! reference counts, a table of environments each holding a sparse page
//! table, and permission-checked memory access with fault delivery.
//!
//! Fault delivery follows the upcall contract of the real kernel. A denied
//! user write looks up the environment's registered trampoline, verifies
//! that the exception-stack page is mapped and privately writable (a
//! handler that could itself fault on its stack would recurse forever),
//! invokes the handler synchronously, and retries the access once. A
//! second denial, a fault with no handler installed, or a handler error
//! all terminate the environment. There is no partial recovery; a fault
//! the protocol cannot resolve denotes a bug, not a transient condition.

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};

use crate::{
    KernelError, warning,
    addressing::{PAGE_SIZE, UXSTACK_BASE, Va, Vpn},
    env::{EnvId, EnvServices, EnvStatus, Exofork, FaultCause, FaultEntry, UserTrapframe},
    page_table::{FrameId, Pte, PteFlags},
};

/// Default number of physical frames the machine owns.
pub const DEFAULT_FRAME_LIMIT: usize = 1 << 14;

struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    refs: usize,
}

struct Env {
    status: EnvStatus,
    parent: Option<EnvId>,
    pgtbl: BTreeMap<Vpn, Pte>,
    trampoline: Option<FaultEntry>,
    // Set on a child created by exofork that has not resumed yet. Its
    // first exofork call observes the child side of the double return.
    fresh_child: bool,
}

/// The machine: frames, environments, and the rules connecting them.
pub struct Machine {
    frames: Vec<Option<Frame>>,
    free_frames: Vec<usize>,
    frame_limit: usize,
    envs: Vec<Option<Env>>,
}

impl Machine {
    /// Create a machine with the default frame budget.
    pub fn new() -> Self {
        Self::with_frame_limit(DEFAULT_FRAME_LIMIT)
    }

    /// Create a machine owning at most `frame_limit` physical frames.
    /// Allocation beyond the limit fails with [`KernelError::NoMemory`].
    pub fn with_frame_limit(frame_limit: usize) -> Self {
        Self {
            frames: Vec::new(),
            free_frames: Vec::new(),
            frame_limit,
            envs: Vec::new(),
        }
    }

    /// Create a fresh runnable environment with an empty address space.
    pub fn env_create(&mut self) -> EnvId {
        self.spawn_env(None, EnvStatus::Runnable, false)
    }

    /// An [`EnvServices`] bound to `env` as the calling environment.
    pub fn env(&mut self, env: EnvId) -> EnvHandle<'_> {
        EnvHandle { machine: self, cur: env }
    }

    /// Current scheduling state of `env`, if it exists.
    pub fn status(&self, env: EnvId) -> Option<EnvStatus> {
        self.env_ref(env).ok().map(|e| e.status)
    }

    /// Raw page-table walk: the entry for `vpn` in `env`, if mapped.
    pub fn mapping(&self, env: EnvId, vpn: Vpn) -> Option<Pte> {
        self.env_ref(env).ok()?.pgtbl.get(&vpn).copied()
    }

    /// Overwrite the permission bits of an existing mapping, keeping the
    /// frame. Clearing [`PteFlags::P`] drops the mapping entirely.
    ///
    /// This is the raw edit surface of the kernel debugger. It performs no
    /// copy-on-write bookkeeping of its own.
    pub fn set_mapping_flags(
        &mut self,
        env: EnvId,
        vpn: Vpn,
        flags: PteFlags,
    ) -> Result<(), KernelError> {
        if !flags.contains(PteFlags::P) {
            self.remove_mapping(env, vpn)?;
            return Ok(());
        }
        self.env_mut(env)?
            .pgtbl
            .get_mut(&vpn)
            .ok_or(KernelError::NoSuchEntry)?
            .set_flags(flags);
        Ok(())
    }

    /// Read-only contents of a frame, if allocated.
    pub fn frame_contents(&self, frame: FrameId) -> Option<&[u8]> {
        self.frames
            .get(frame.into_usize())?
            .as_ref()
            .map(|f| &f.data[..])
    }

    fn spawn_env(&mut self, parent: Option<EnvId>, status: EnvStatus, fresh: bool) -> EnvId {
        let id = EnvId::new(self.envs.len());
        self.envs.push(Some(Env {
            status,
            parent,
            pgtbl: BTreeMap::new(),
            trampoline: None,
            fresh_child: fresh,
        }));
        id
    }

    fn env_ref(&self, env: EnvId) -> Result<&Env, KernelError> {
        self.envs
            .get(env.into_usize())
            .and_then(|e| e.as_ref())
            .ok_or(KernelError::NoSuchEntry)
    }

    fn env_mut(&mut self, env: EnvId) -> Result<&mut Env, KernelError> {
        self.envs
            .get_mut(env.into_usize())
            .and_then(|e| e.as_mut())
            .ok_or(KernelError::NoSuchEntry)
    }

    fn alloc_frame(&mut self) -> Result<FrameId, KernelError> {
        if let Some(idx) = self.free_frames.pop() {
            self.frames[idx] = Some(Frame {
                data: Box::new([0u8; PAGE_SIZE]),
                refs: 0,
            });
            return Ok(FrameId::new(idx));
        }
        if self.frames.len() >= self.frame_limit {
            return Err(KernelError::NoMemory);
        }
        self.frames.push(Some(Frame {
            data: Box::new([0u8; PAGE_SIZE]),
            refs: 0,
        }));
        Ok(FrameId::new(self.frames.len() - 1))
    }

    fn retain_frame(&mut self, frame: FrameId) {
        if let Some(Some(f)) = self.frames.get_mut(frame.into_usize()) {
            f.refs += 1;
        }
    }

    fn release_frame(&mut self, frame: FrameId) {
        let idx = frame.into_usize();
        if let Some(Some(f)) = self.frames.get_mut(idx) {
            f.refs -= 1;
            if f.refs == 0 {
                self.frames[idx] = None;
                self.free_frames.push(idx);
            }
        }
    }

    fn frame_data_mut(&mut self, frame: FrameId) -> Result<&mut [u8; PAGE_SIZE], KernelError> {
        self.frames
            .get_mut(frame.into_usize())
            .and_then(|f| f.as_mut())
            .map(|f| &mut *f.data)
            .ok_or(KernelError::BadAddress)
    }

    // Retain the new frame before releasing the displaced one, so that
    // re-mapping a frame over itself never drops its refcount to zero.
    fn insert_mapping(
        &mut self,
        env: EnvId,
        vpn: Vpn,
        frame: FrameId,
        flags: PteFlags,
    ) -> Result<(), KernelError> {
        self.retain_frame(frame);
        let old = self
            .env_mut(env)?
            .pgtbl
            .insert(vpn, Pte::new(frame, flags));
        if let Some(frame) = old.and_then(|pte| pte.frame()) {
            self.release_frame(frame);
        }
        Ok(())
    }

    fn remove_mapping(&mut self, env: EnvId, vpn: Vpn) -> Result<(), KernelError> {
        let old = self.env_mut(env)?.pgtbl.remove(&vpn);
        if let Some(frame) = old.and_then(|pte| pte.frame()) {
            self.release_frame(frame);
        }
        Ok(())
    }

    fn note_access(&mut self, env: EnvId, vpn: Vpn, dirty: bool) {
        if let Ok(env) = self.env_mut(env) {
            if let Some(pte) = env.pgtbl.get_mut(&vpn) {
                let mut flags = pte.flags() | PteFlags::A;
                if dirty {
                    flags |= PteFlags::D;
                }
                pte.set_flags(flags);
            }
        }
    }

    fn terminate(&mut self, env: EnvId, why: &str) {
        let vpns: Vec<Vpn> = match self.env_ref(env) {
            Ok(e) if e.status != EnvStatus::Dying => e.pgtbl.keys().copied().collect(),
            _ => return,
        };
        warning!("{:?} terminated: {}", env, why);
        for vpn in vpns {
            let _ = self.remove_mapping(env, vpn);
        }
        if let Ok(e) = self.env_mut(env) {
            e.status = EnvStatus::Dying;
            e.trampoline = None;
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

/// An [`EnvServices`] implementation bound to one calling environment.
///
/// The bound identity is the context-passed self-reference of the
/// environment; [`EnvServices::getenvid`] reads it, and nothing inherits
/// it through duplicated memory.
pub struct EnvHandle<'m> {
    machine: &'m mut Machine,
    cur: EnvId,
}

impl EnvHandle<'_> {
    // An environment may manage itself and its immediate children.
    fn checked_env(&self, env: EnvId) -> Result<(), KernelError> {
        let cur = self.machine.env_ref(self.cur)?;
        if cur.status == EnvStatus::Dying {
            return Err(KernelError::OperationNotPermitted);
        }
        if env == self.cur {
            return Ok(());
        }
        let target = self.machine.env_ref(env)?;
        if target.status == EnvStatus::Dying || target.parent != Some(self.cur) {
            return Err(KernelError::OperationNotPermitted);
        }
        Ok(())
    }

    fn user_page(va: Va) -> Result<Vpn, KernelError> {
        if va.offset() != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if !va.is_user() {
            return Err(KernelError::BadAddress);
        }
        Ok(va.page_number())
    }

    fn check_flags(flags: PteFlags) -> Result<(), KernelError> {
        if !flags.contains(PteFlags::P | PteFlags::US)
            || !(flags & !PteFlags::SYSCALL).is_empty()
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    /// Translate one user access, delivering a fault and retrying once if
    /// the access is denied.
    fn translate(&mut self, va: Va, write: bool) -> Result<FrameId, KernelError> {
        let mut needed = PteFlags::P | PteFlags::US;
        if write {
            needed |= PteFlags::RW;
        }
        for retried in [false, true] {
            if self.machine.env_ref(self.cur)?.status == EnvStatus::Dying {
                return Err(KernelError::OperationNotPermitted);
            }
            let vpn = va.page_number();
            let pte = if va.is_user() {
                self.machine.mapping(self.cur, vpn)
            } else {
                None
            };
            if let Some(pte) = pte {
                if pte.flags().contains(needed) {
                    self.machine.note_access(self.cur, vpn, write);
                    return pte.frame().ok_or(KernelError::BadAddress);
                }
            }
            if retried {
                // The handler ran but the page is still not accessible.
                // Retrying forever would loop; terminate instead.
                self.machine.terminate(self.cur, "unresolved fault loop");
                return Err(KernelError::InvalidAccess);
            }
            let mut cause = FaultCause::USER;
            if write {
                cause |= FaultCause::WRITE;
            }
            if pte.is_some() {
                cause |= FaultCause::PROTECTION;
            }
            self.deliver_fault(va, cause)?;
        }
        Err(KernelError::InvalidAccess)
    }

    fn deliver_fault(&mut self, va: Va, cause: FaultCause) -> Result<(), KernelError> {
        let (entry, uxstack_ok) = {
            let env = self.machine.env_ref(self.cur)?;
            let uxstack_ok = env
                .pgtbl
                .get(&UXSTACK_BASE.page_number())
                .map(|pte| {
                    let flags = pte.flags();
                    flags.contains(PteFlags::P | PteFlags::RW | PteFlags::US)
                        && !flags.contains(PteFlags::COW)
                })
                .unwrap_or(false);
            (env.trampoline, uxstack_ok)
        };
        let Some(entry) = entry else {
            self.machine.terminate(self.cur, "page fault with no handler");
            return Err(KernelError::InvalidAccess);
        };
        if !uxstack_ok {
            self.machine
                .terminate(self.cur, "exception stack not privately writable");
            return Err(KernelError::InvalidAccess);
        }
        let tf = UserTrapframe { fault_va: va, cause };
        match entry(self, &tf) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.machine.terminate(self.cur, "fault handler failed");
                Err(e)
            }
        }
    }
}

impl EnvServices for EnvHandle<'_> {
    fn getenvid(&self) -> EnvId {
        self.cur
    }

    fn lookup_mapping(&self, vpn: Vpn) -> Option<Pte> {
        if vpn < Vpn::USER_LIMIT {
            self.machine.mapping(self.cur, vpn)
        } else {
            None
        }
    }

    fn page_alloc(&mut self, env: EnvId, va: Va, flags: PteFlags) -> Result<(), KernelError> {
        self.checked_env(env)?;
        let vpn = Self::user_page(va)?;
        Self::check_flags(flags)?;
        let frame = self.machine.alloc_frame()?;
        self.machine.insert_mapping(env, vpn, frame, flags)
    }

    fn page_map(
        &mut self,
        src: EnvId,
        src_va: Va,
        dst: EnvId,
        dst_va: Va,
        flags: PteFlags,
    ) -> Result<(), KernelError> {
        self.checked_env(src)?;
        self.checked_env(dst)?;
        let src_vpn = Self::user_page(src_va)?;
        let dst_vpn = Self::user_page(dst_va)?;
        Self::check_flags(flags)?;
        let src_pte = self
            .machine
            .mapping(src, src_vpn)
            .ok_or(KernelError::NoSuchEntry)?;
        // A read-only frame may not be re-exported writable.
        if flags.contains(PteFlags::RW) && !src_pte.flags().contains(PteFlags::RW) {
            return Err(KernelError::InvalidArgument);
        }
        let frame = src_pte.frame().ok_or(KernelError::NoSuchEntry)?;
        self.machine.insert_mapping(dst, dst_vpn, frame, flags)
    }

    fn page_unmap(&mut self, env: EnvId, va: Va) -> Result<(), KernelError> {
        self.checked_env(env)?;
        let vpn = Self::user_page(va)?;
        self.machine.remove_mapping(env, vpn)
    }

    fn exofork(&mut self) -> Result<Exofork, KernelError> {
        let env = self.machine.env_mut(self.cur)?;
        if env.fresh_child {
            env.fresh_child = false;
            return Ok(Exofork::Child);
        }
        if env.status == EnvStatus::Dying {
            return Err(KernelError::OperationNotPermitted);
        }
        let child = self
            .machine
            .spawn_env(Some(self.cur), EnvStatus::NotRunnable, true);
        Ok(Exofork::Parent(child))
    }

    fn install_fault_trampoline(
        &mut self,
        env: EnvId,
        entry: FaultEntry,
    ) -> Result<(), KernelError> {
        self.checked_env(env)?;
        self.machine.env_mut(env)?.trampoline = Some(entry);
        Ok(())
    }

    fn set_status(&mut self, env: EnvId, status: EnvStatus) -> Result<(), KernelError> {
        self.checked_env(env)?;
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(KernelError::InvalidArgument);
        }
        self.machine.env_mut(env)?.status = status;
        Ok(())
    }

    fn register_fault_handler(&mut self, entry: FaultEntry) -> Result<(), KernelError> {
        self.checked_env(self.cur)?;
        let uxstack_vpn = UXSTACK_BASE.page_number();
        if self.machine.mapping(self.cur, uxstack_vpn).is_none() {
            let frame = self.machine.alloc_frame()?;
            self.machine.insert_mapping(
                self.cur,
                uxstack_vpn,
                frame,
                PteFlags::P | PteFlags::RW | PteFlags::US,
            )?;
        }
        self.machine.env_mut(self.cur)?.trampoline = Some(entry);
        Ok(())
    }

    fn read_bytes(&mut self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        let mut addr = va.into_usize();
        let mut done = 0;
        while done < buf.len() {
            let va = Va::new(addr).ok_or(KernelError::BadAddress)?;
            let len = (PAGE_SIZE - va.offset()).min(buf.len() - done);
            let frame = self.translate(va, false)?;
            let data = self.machine.frame_data_mut(frame)?;
            buf[done..done + len].copy_from_slice(&data[va.offset()..va.offset() + len]);
            addr += len;
            done += len;
        }
        Ok(())
    }

    fn write_bytes(&mut self, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        let mut addr = va.into_usize();
        let mut done = 0;
        while done < buf.len() {
            let va = Va::new(addr).ok_or(KernelError::BadAddress)?;
            let len = (PAGE_SIZE - va.offset()).min(buf.len() - done);
            let frame = self.translate(va, true)?;
            let data = self.machine.frame_data_mut(frame)?;
            data[va.offset()..va.offset() + len].copy_from_slice(&buf[done..done + len]);
            addr += len;
            done += len;
        }
        Ok(())
    }
}
