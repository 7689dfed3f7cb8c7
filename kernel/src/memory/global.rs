//! Process-wide memory context
//!
//! The memory core has one instance for the lifetime of the firmware. It is
//! installed once after [`MemoryContext::init`] and reached from the fault
//! trap, the scheduler and drivers through [`GlobalMemory::with`], which
//! masks interrupts for the duration of the call.

use core::cell::RefCell;

use critical_section::CriticalSection;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_hal::delay::DelayNs;

use super::init::MemoryContext;
use super::{MemoryError, VirtualAddress};
use crate::arch::{DmaHardware, MpuHardware};
use crate::dma::{DmaError, DmaRequest};
use crate::odp::OdpError;
use crate::safety::{FatalReason, fatal};
use crate::{KernelError, KernelResult};

/// Extra attempts made while the DMA aperture is gated
pub const SUSPEND_RETRIES: u32 = 8;

/// Pause between attempts on a gated aperture
pub const SUSPEND_BACKOFF_US: u32 = 100;

/// Memory context shared by every execution context
pub struct GlobalMemory<M: MpuHardware, D: DmaHardware> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Option<MemoryContext<M, D>>>>,
}

impl<M: MpuHardware, D: DmaHardware> GlobalMemory<M, D> {
    /// Empty slot, suitable for a `static`
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Install the context; only the first call succeeds
    pub fn install(&self, ctx: MemoryContext<M, D>) -> KernelResult<()> {
        critical_section::with(|cs| -> KernelResult<()> {
            let mut slot = self
                .inner
                .borrow(cs)
                .try_borrow_mut()
                .map_err(|_| MemoryError::Reentered)?;
            if slot.is_some() {
                debug_print!(ERROR, "global: memory context installed twice");
                return Err(MemoryError::AlreadyInitialized.into());
            }
            *slot = Some(ctx);
            debug_print!(INFO, "global: memory context installed");
            Ok(())
        })
    }

    /// Whether [`Self::install`] has run
    pub fn is_installed(&self) -> bool {
        critical_section::with(|cs| {
            self.inner
                .borrow(cs)
                .try_borrow()
                .is_ok_and(|slot| slot.is_some())
        })
    }

    /// Run `f` on the context with interrupts masked.
    ///
    /// Not reentrant: calling back into `with` from `f` fails with
    /// [`MemoryError::Reentered`].
    pub fn with<R>(&self, f: impl FnOnce(CriticalSection<'_>, &mut MemoryContext<M, D>) -> R) -> KernelResult<R> {
        critical_section::with(|cs| -> KernelResult<R> {
            let mut slot = self
                .inner
                .borrow(cs)
                .try_borrow_mut()
                .map_err(|_| MemoryError::Reentered)?;
            let ctx = slot.as_mut().ok_or(MemoryError::Uninitialized)?;
            Ok(f(cs, ctx))
        })
    }

    /// Fault trap entry; false if the fault could not be serviced
    pub fn handle_fault(&self, va: VirtualAddress) -> bool {
        self.with(|cs, ctx| ctx.handle_fault(cs, va)).unwrap_or(false)
    }

    /// Fault trap entry for traps that cannot return unserviced
    pub fn handle_fault_or_halt(&self, va: VirtualAddress) {
        if !self.handle_fault(va) {
            fatal(FatalReason::UnhandledFault { va: va.as_usize() });
        }
    }

    /// [`MemoryContext::dma_transfer`], retried while the aperture is gated.
    ///
    /// Interrupts are unmasked while waiting so the low-power state can end.
    pub fn dma_transfer_retry(&self, delay: &mut impl DelayNs, req: &DmaRequest) -> KernelResult<()> {
        let mut attempt = 0;
        loop {
            match self.with(|cs, ctx| ctx.dma_transfer(cs, req))? {
                Err(e) if is_suspended(&e) && attempt < SUSPEND_RETRIES => {
                    attempt += 1;
                    debug_print!(DEBUG, "global: DMA suspended, retry {}", attempt);
                    delay.delay_us(SUSPEND_BACKOFF_US);
                }
                result => return result,
            }
        }
    }
}

impl<M: MpuHardware, D: DmaHardware> Default for GlobalMemory<M, D> {
    fn default() -> Self {
        Self::new()
    }
}

fn is_suspended(e: &KernelError) -> bool {
    matches!(
        e,
        KernelError::Dma(DmaError::Suspended) | KernelError::Odp(OdpError::Dma(DmaError::Suspended))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaDirection;
    use crate::memory::init::ImageLayout;
    use crate::memory::{Aperture, Location, MemDesc, PhysicalAddress, Section, SectionAttr, SectionTable};
    use crate::platform::sim::{SimDma, SimMpu, test_config};

    const DATA: usize = 0x2000_0000;
    const PAGE: usize = 4096;

    type Global = GlobalMemory<SimMpu, SimDma>;

    fn context(cs: CriticalSection<'_>) -> MemoryContext<SimMpu, SimDma> {
        let config = test_config();
        let sections = SectionTable::from_slice(&[
            Section::new(".text", 0x1000_0000, 0x1_0000, PAGE, SectionAttr::READ, Location::OdpCode),
            Section::new(".data", DATA, 0, 4 * PAGE, SectionAttr::READ | SectionAttr::WRITE, Location::OdpData),
        ])
        .unwrap();
        let layout = ImageLayout {
            fb_copy: PhysicalAddress::new(0x8000_0000),
            image_base: None,
        };
        MemoryContext::init(
            cs,
            &config,
            SimMpu::new(config.mpu_slots),
            SimDma::new(&config),
            sections,
            layout,
            None,
        )
        .unwrap()
    }

    fn installed() -> Global {
        let global = Global::new();
        let ctx = critical_section::with(context);
        global.install(ctx).unwrap();
        global
    }

    fn request() -> DmaRequest {
        DmaRequest {
            buf: VirtualAddress::new(DATA),
            desc: MemDesc { aperture: Aperture::SysMem, offset: 0 },
            offset: 0,
            size: PAGE,
            direction: DmaDirection::ToTcm,
            secure: false,
        }
    }

    /// Ends the low-power state after `wake_after` pauses
    struct Wake<'a> {
        global: &'a Global,
        wake_after: u32,
        pauses: u32,
    }

    impl DelayNs for Wake<'_> {
        fn delay_ns(&mut self, _ns: u32) {
            self.pauses += 1;
            if self.pauses == self.wake_after {
                self.global
                    .with(|_, ctx| ctx.dma_mut().hardware_mut().suspended = false)
                    .unwrap();
            }
        }
    }

    fn suspend(global: &Global) {
        global
            .with(|_, ctx| ctx.dma_mut().hardware_mut().suspended = true)
            .unwrap();
    }

    #[test]
    fn access_before_install_fails() {
        let global = Global::new();
        assert!(!global.is_installed());
        assert_eq!(
            global.with(|_, _| ()),
            Err(KernelError::Memory(MemoryError::Uninitialized))
        );
        assert!(!global.handle_fault(VirtualAddress::new(DATA)));
    }

    #[test]
    fn second_install_is_rejected() {
        let global = installed();
        assert!(global.is_installed());
        let again = critical_section::with(context);
        assert_eq!(
            global.install(again),
            Err(KernelError::Memory(MemoryError::AlreadyInitialized))
        );
    }

    #[test]
    fn nested_access_is_rejected() {
        let global = installed();
        let inner = global.with(|_, _| global.with(|_, _| ())).unwrap();
        assert_eq!(inner, Err(KernelError::Memory(MemoryError::Reentered)));
    }

    #[test]
    fn fault_trap_services_paged_addresses() {
        let global = installed();
        assert!(global.handle_fault(VirtualAddress::new(DATA + 0x40)));
        global.handle_fault_or_halt(VirtualAddress::new(DATA + PAGE));
        let resident = global
            .with(|_, ctx| ctx.odp().resident_page(VirtualAddress::new(DATA + PAGE)).is_some())
            .unwrap();
        assert!(resident);
    }

    #[test]
    #[should_panic(expected = "unhandled memory fault")]
    fn unserviceable_fault_halts() {
        let global = installed();
        global.handle_fault_or_halt(VirtualAddress::new(0x3000_0000));
    }

    #[test]
    fn retry_waits_out_suspension() {
        let global = installed();
        suspend(&global);
        let mut delay = Wake { global: &global, wake_after: 3, pauses: 0 };
        assert_eq!(global.dma_transfer_retry(&mut delay, &request()), Ok(()));
        assert_eq!(delay.pauses, 3);
    }

    #[test]
    fn retry_gives_up_after_bounded_attempts() {
        let global = installed();
        suspend(&global);
        let mut delay = Wake { global: &global, wake_after: u32::MAX, pauses: 0 };
        let err = global.dma_transfer_retry(&mut delay, &request()).unwrap_err();
        assert!(is_suspended(&err));
        assert_eq!(delay.pauses, SUSPEND_RETRIES);
    }

    #[test]
    fn non_transient_errors_are_not_retried() {
        let global = installed();
        let mut delay = Wake { global: &global, wake_after: u32::MAX, pauses: 0 };
        let mut req = request();
        req.size = 3;
        assert_eq!(
            global.dma_transfer_retry(&mut delay, &req),
            Err(KernelError::Dma(DmaError::Alignment))
        );
        assert_eq!(delay.pauses, 0);
    }
}
