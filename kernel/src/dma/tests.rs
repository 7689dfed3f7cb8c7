//! DMA engine tests against the simulated queue

use super::*;
use crate::memory::Aperture;
use crate::platform::sim::{SimDma, test_config};

const DTCM_VA: usize = 0x0018_0000;
const ITCM_VA: usize = 0x0010_0000;
const RUN: usize = 4096;

fn engine() -> DmaEngine<SimDma> {
    let config = test_config();
    DmaEngine::new(SimDma::new(&config), config.dma)
}

/// Identity translation of the TCM windows, one run per 4K page
fn identity(va: VirtualAddress) -> Option<TcmRun> {
    let va = va.as_usize();
    let (tcm, base) = if (DTCM_VA..DTCM_VA + 4 * RUN).contains(&va) {
        (TcmKind::Dtcm, DTCM_VA)
    } else if (ITCM_VA..ITCM_VA + 4 * RUN).contains(&va) {
        (TcmKind::Itcm, ITCM_VA)
    } else {
        return None;
    };
    let offset = va - base;
    Some(TcmRun { tcm, offset, len: RUN - offset % RUN })
}

fn fb(offset: u64) -> MemDesc {
    MemDesc { aperture: Aperture::FrameBuffer, offset }
}

#[test]
fn unaligned_size_rejected_without_hardware_writes() {
    let mut dma = engine();
    let result = dma.mem_transfer(
        identity,
        VirtualAddress::new(DTCM_VA),
        fb(0),
        0,
        3,
        DmaDirection::FromTcm,
        false,
    );
    assert_eq!(result, Err(DmaError::Alignment));
    assert!(dma.hardware().log.is_empty());
    assert!(dma.hardware().fences.is_empty());
}

#[test]
fn unaligned_buffer_and_offset_rejected() {
    let mut dma = engine();
    let buf = VirtualAddress::new(DTCM_VA + 2);
    assert_eq!(
        dma.mem_transfer(identity, buf, fb(0), 0, 8, DmaDirection::FromTcm, false),
        Err(DmaError::Alignment)
    );
    let buf = VirtualAddress::new(DTCM_VA);
    assert_eq!(
        dma.mem_transfer(identity, buf, fb(0), 6, 8, DmaDirection::FromTcm, false),
        Err(DmaError::Alignment)
    );
}

#[test]
fn wrapping_ranges_rejected_without_hardware_writes() {
    let mut dma = engine();
    let top = VirtualAddress::new(usize::MAX & !(RUN - 1));
    assert_eq!(
        dma.mem_transfer(identity, top, fb(0), 0, 2 * RUN, DmaDirection::ToTcm, false),
        Err(DmaError::InvalidArgument)
    );
    let buf = VirtualAddress::new(DTCM_VA);
    assert_eq!(
        dma.mem_transfer(identity, buf, fb(u64::MAX & !0xff), 0x100, RUN, DmaDirection::ToTcm, false),
        Err(DmaError::InvalidArgument)
    );
    assert!(dma.hardware().log.is_empty());
    assert!(dma.hardware().fences.is_empty());
}

#[test]
fn zero_size_is_a_no_op() {
    let mut dma = engine();
    let buf = VirtualAddress::new(DTCM_VA);
    assert_eq!(
        dma.mem_transfer(identity, buf, fb(0), 0, 0, DmaDirection::ToTcm, false),
        Ok(())
    );
    assert!(dma.hardware().log.is_empty());
}

#[test]
fn writes_into_itcm_rejected() {
    let mut dma = engine();
    let buf = VirtualAddress::new(ITCM_VA);
    assert_eq!(
        dma.mem_transfer(identity, buf, fb(0), 0, 64, DmaDirection::ToTcm, false),
        Err(DmaError::InvalidArgument)
    );
    assert!(dma.hardware().log.is_empty());
    // Reading code out of ITCM is allowed.
    assert_eq!(
        dma.mem_transfer(identity, buf, fb(0), 0, 64, DmaDirection::FromTcm, false),
        Ok(())
    );
}

#[test]
fn itcm_minimum_block_enforced() {
    let mut dma = engine();
    let buf = VirtualAddress::new(ITCM_VA);
    assert_eq!(
        dma.mem_transfer(identity, buf, fb(0), 0, 8, DmaDirection::FromTcm, false),
        Err(DmaError::Alignment)
    );
}

#[test]
fn long_transfer_splits_blocks_and_translates_per_run() {
    let mut dma = engine();
    let pattern: std::vec::Vec<u8> = (0..2 * RUN + 512).map(|i| (i % 251) as u8).collect();
    dma.hardware_mut().tcm(TcmKind::Dtcm)[256..256 + pattern.len()].copy_from_slice(&pattern);

    let mut translations = 0;
    let result = dma.mem_transfer(
        |va| {
            translations += 1;
            identity(va)
        },
        VirtualAddress::new(DTCM_VA + 256),
        fb(0x1000),
        0x100,
        pattern.len(),
        DmaDirection::FromTcm,
        true,
    );
    assert_eq!(result, Ok(()));
    // Runs: [256, 4096), [4096, 8192), [8192, 8960)
    assert_eq!(translations, 3);

    let hw = dma.hardware_mut();
    assert!(hw.log.iter().all(|c| c.size <= 256 && c.size.is_power_of_two() && c.secure));
    assert_eq!(hw.log.iter().map(|c| c.size).sum::<usize>(), pattern.len());
    assert_eq!(hw.ext(fb(0x1100), pattern.len()), &pattern[..]);
    assert_eq!(hw.fences, [FenceKind::InvalidateAndFence, FenceKind::InvalidateAndFence]);
}

#[test]
fn misaligned_ends_use_smaller_blocks() {
    let mut dma = engine();
    let buf = VirtualAddress::new(DTCM_VA + 4);
    assert_eq!(
        dma.mem_transfer(identity, buf, fb(4), 0, 8, DmaDirection::ToTcm, false),
        Ok(())
    );
    let sizes: std::vec::Vec<usize> = dma.hardware().log.iter().map(|c| c.size).collect();
    assert_eq!(sizes, [4, 4]);
}

#[test]
fn suspended_aperture_reported_with_light_fence() {
    let mut dma = engine();
    dma.hardware_mut().suspended = true;
    let buf = VirtualAddress::new(DTCM_VA);
    assert_eq!(
        dma.mem_transfer(identity, buf, fb(0), 0, 64, DmaDirection::ToTcm, false),
        Err(DmaError::Suspended)
    );
    assert!(dma.hardware().log.is_empty());
    assert_eq!(dma.hardware().fences, [FenceKind::Light]);
}

#[test]
fn untranslatable_buffer_rejected() {
    let mut dma = engine();
    let buf = VirtualAddress::new(0x9000_0000);
    assert_eq!(
        dma.mem_transfer(identity, buf, fb(0), 0, 64, DmaDirection::ToTcm, false),
        Err(DmaError::InvalidArgument)
    );
}

#[test]
#[should_panic(expected = "DMA queue-full timeout")]
fn wedged_queue_is_fatal() {
    let mut dma = engine();
    dma.hardware_mut().stalled = true;
    let buf = VirtualAddress::new(DTCM_VA);
    let _ = dma.mem_transfer(identity, buf, fb(0), 0, 64, DmaDirection::ToTcm, false);
}

#[test]
fn nack_latch_checked_and_cleared() {
    let mut dma = engine();
    dma.hardware_mut().nack_next = true;
    let buf = VirtualAddress::new(DTCM_VA);
    let result = dma.mem_transfer(identity, buf, fb(0), 0, 4, DmaDirection::FromTcm, false);
    if cfg!(feature = "nack-check") {
        assert_eq!(result, Err(DmaError::Nack));
    } else {
        assert_eq!(result, Ok(()));
        assert_eq!(dma.nack_check_and_clear(), Err(DmaError::Nack));
    }
    assert_eq!(dma.nack_check_and_clear(), Ok(()));
}

#[test]
fn odp_xfer_issues_full_blocks() {
    let mut dma = engine();
    let ext = fb(0x2000);
    dma.hardware_mut().ext(ext, 4096).fill(0xA5);
    let template = *dma.templates().fill(TcmKind::Dtcm);
    assert_eq!(dma.odp_xfer(template, 4096, ext, 4096), Ok(()));
    let hw = dma.hardware_mut();
    assert_eq!(hw.log.len(), 4096 / 256);
    assert!(hw.log.iter().all(|c| c.size == 256 && c.direction == DmaDirection::ToTcm));
    assert!(hw.tcm(TcmKind::Dtcm)[4096..8192].iter().all(|b| *b == 0xA5));
}

#[test]
fn block_size_respects_alignment_and_bounds() {
    assert_eq!(block_size(0, 0, 4096, 4, 256), Some(256));
    assert_eq!(block_size(64, 0, 4096, 4, 256), Some(64));
    assert_eq!(block_size(0, 0, 12, 4, 256), Some(8));
    assert_eq!(block_size(2, 0, 12, 4, 256), None);
}
