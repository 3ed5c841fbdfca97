use xlat_core::{NativePcStrategy, XlatConfig, XlatError};
use xlat_backend::NativePcResolver;

use super::setup;
use crate::guest::*;

#[test]
fn helper_recovers_calling_instruction() {
    let (mut compiler, mut guest) = setup(XlatConfig::default());
    guest.load(0x1000, &[NOP, addi(0, 1), PROBE, NOP, PROBE, END]);
    guest.regs().pc = 0x1000;

    guest.run(&mut compiler, 1).unwrap();
    assert_eq!(guest.machine.sampled_pcs, vec![Some(0x1004), Some(0x1008)]);
    assert_eq!(guest.regs().slice_cycle, 6);
}

#[test]
fn lookup_outside_generated_code_fails() {
    let (compiler, mut guest) = setup(XlatConfig::default());
    let resolver = NativePcResolver::new(NativePcStrategy::Unwind);
    let err = compiler
        .cache()
        .current_guest_pc(&resolver, guest.regs_ptr())
        .unwrap_err();
    assert!(matches!(err, XlatError::NativePcNotFound { ip: None }));
}
