#![allow(dead_code)]
use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use embedded_hal::delay::DelayNs;
use scan_adc::{
    CalibrationMode, Converter, Instance, Resolution, SequenceLayout, TransferBuffer,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Call {
    Start,
    Stop,
    Calibrate(CalibrationMode),
    StartTransfer(usize),
    StartMultimodeTransfer(usize),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct HwFault;

/// Peripheral state shared between a test and the driver owning the [FakeConverter]
pub struct Hw {
    pub instance: Instance,
    pub running: bool,
    pub dma: bool,
    pub multimode: bool,
    pub continuous: bool,
    pub circular: bool,
    pub resolution: Resolution,
    pub registers: [u32; 4],
    /// Results served by the polled reads, one per end of conversion
    pub samples: VecDeque<u16>,
    pub packed: VecDeque<u32>,
    /// Written into the buffer whenever a transfer is started
    pub dma_samples: Vec<u16>,
    pub dma_words: Vec<u32>,
    pub calls: Vec<Call>,
    pub fail_on: Option<Call>,
    /// Number of polls which returned `WouldBlock`
    pub busy_polls: usize,
    eoc: bool,
}

impl Hw {
    pub fn new(instance: Instance, registers: [u32; 4]) -> Self {
        Hw {
            instance,
            running: false,
            dma: false,
            multimode: false,
            continuous: false,
            circular: false,
            resolution: Resolution::TwelveBit,
            registers,
            samples: VecDeque::new(),
            packed: VecDeque::new(),
            dma_samples: Vec::new(),
            dma_words: Vec::new(),
            calls: Vec::new(),
            fail_on: None,
            busy_polls: 0,
            eoc: false,
        }
    }

    fn record(&mut self, call: Call) -> Result<(), HwFault> {
        if self.fail_on == Some(call) {
            return Err(HwFault);
        }
        self.calls.push(call);
        Ok(())
    }

    /// Every other poll reports a conversion still in progress
    fn poll_eoc(&mut self) -> nb::Result<(), HwFault> {
        if !self.eoc {
            self.eoc = true;
            self.busy_polls += 1;
            return Err(nb::Error::WouldBlock);
        }
        self.eoc = false;
        Ok(())
    }
}

pub struct FakeConverter {
    hw: Rc<RefCell<Hw>>,
}

impl FakeConverter {
    pub fn new(hw: Hw) -> (Self, Rc<RefCell<Hw>>) {
        let hw = Rc::new(RefCell::new(hw));
        (FakeConverter { hw: hw.clone() }, hw)
    }
}

impl Converter for FakeConverter {
    type Error = HwFault;

    fn instance(&self) -> Instance {
        self.hw.borrow().instance
    }

    fn is_conversion_running(&self) -> bool {
        self.hw.borrow().running
    }

    fn start(&mut self) -> Result<(), HwFault> {
        let mut hw = self.hw.borrow_mut();
        hw.record(Call::Start)?;
        hw.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HwFault> {
        let mut hw = self.hw.borrow_mut();
        hw.record(Call::Stop)?;
        hw.running = false;
        Ok(())
    }

    fn start_transfer(&mut self, buffer: &mut [u16]) -> Result<(), HwFault> {
        let mut hw = self.hw.borrow_mut();
        hw.record(Call::StartTransfer(buffer.len()))?;
        for (dst, src) in buffer.iter_mut().zip(hw.dma_samples.iter()) {
            *dst = *src;
        }
        hw.running = true;
        Ok(())
    }

    fn start_multimode_transfer(&mut self, buffer: &mut [u32]) -> Result<(), HwFault> {
        let mut hw = self.hw.borrow_mut();
        hw.record(Call::StartMultimodeTransfer(buffer.len()))?;
        for (dst, src) in buffer.iter_mut().zip(hw.dma_words.iter()) {
            *dst = *src;
        }
        hw.running = true;
        Ok(())
    }

    fn calibrate(&mut self, mode: CalibrationMode) -> Result<(), HwFault> {
        self.hw.borrow_mut().record(Call::Calibrate(mode))
    }

    fn read_last_converted(&mut self) -> nb::Result<u16, HwFault> {
        let mut hw = self.hw.borrow_mut();
        hw.poll_eoc()?;
        hw.samples.pop_front().ok_or(nb::Error::Other(HwFault))
    }

    fn read_last_multimode_converted(&mut self) -> nb::Result<u32, HwFault> {
        let mut hw = self.hw.borrow_mut();
        hw.poll_eoc()?;
        hw.packed.pop_front().ok_or(nb::Error::Other(HwFault))
    }

    fn resolution(&self) -> Resolution {
        self.hw.borrow().resolution
    }

    fn is_dma_enabled(&self) -> bool {
        self.hw.borrow().dma
    }

    fn is_multimode_enabled(&self) -> bool {
        self.hw.borrow().multimode
    }

    fn is_continuous(&self) -> bool {
        self.hw.borrow().continuous
    }

    fn is_dma_circular(&self) -> bool {
        self.hw.borrow().circular
    }

    fn sequence_registers(&self) -> [u32; 4] {
        self.hw.borrow().registers
    }
}

/// Delay which only accumulates the requested time
#[derive(Default)]
pub struct CountingDelay {
    pub ns: u64,
}

impl DelayNs for CountingDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.ns += ns as u64;
    }
}

/// Scan sequence register content which configures `channels` in the given layout
pub fn encode(layout: &SequenceLayout, channels: &[u8]) -> [u32; 4] {
    let mut regs = [0u32; 4];
    regs[layout.length_register as usize] |=
        ((channels.len() as u32 - 1) & layout.length_mask) << layout.length_offset;
    for (rank, &ch) in channels.iter().enumerate() {
        let (reg, offset) = layout.ranks[rank];
        regs[reg as usize] |= (ch as u32) << offset;
    }
    regs
}

pub fn independent_samples<const N: usize>(buffer: &TransferBuffer<N>) -> &[u16] {
    match buffer {
        TransferBuffer::Independent(buf) => buf.samples(),
        TransferBuffer::Multimode(_) => panic!("expected an independent buffer"),
    }
}
