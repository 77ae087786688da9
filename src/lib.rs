//! Scan-sequence aware API for multi-channel STM32-style ADC peripherals
//!
//! ## Usage
//!
//! Wrap your HAL's converter handle in a type implementing [`Converter`] and create the driver
//! with [`ScanAdc::new`], passing the [`HardwareFamily`] preset for your device
//! ([`HardwareFamily::STM32F1`], [`HardwareFamily::STM32F2`], [`HardwareFamily::STM32F3`],
//! [`HardwareFamily::STM32F4`] or [`HardwareFamily::STM32G4`]). The family describes how the
//! scan sequence registers are laid out and which calibration call the device needs.
//!
//! [`ScanAdc::initialize`] calibrates and starts the converter, reads the configured scan
//! sequence back from the hardware and starts the DMA transfer if DMA is enabled. Channels are
//! then read by their channel number with [`ScanAdc::read_channel`] or
//! [`ScanAdc::read_scaled`], no matter at which rank they were configured.
//!
//! Depending on the mode the converter was configured in, a read is served
//!
//!  - by polling the data register until the rank of the channel was converted,
//!  - by averaging the last [`Config::averaged_measures`] scans in an independent DMA buffer,
//!  - by splitting a dual (multimode) DMA buffer into master and slave samples first and
//!    averaging the half which belongs to this converter.
//!
//! ## Dual mode
//!
//! Both converters are initialized with [`ScanAdc::initialize`] using the same
//! [`TransferBuffer::multimode`] buffer. The interleaved transfer is then started once on the
//! master converter with [`ScanAdc::initialize_multimode`]. Both drivers are given the master's
//! buffer on every read.
#![no_std]
use embedded_hal::delay::DelayNs;

#[macro_use]
mod fmt;

//==================================================================================================
// Definitions
//==================================================================================================

/// Maximum number of ranks in a scan sequence
pub const MAX_CONVERSIONS: usize = 16;
/// Highest channel number which may appear in a scan sequence
pub const MAX_CHANNEL_ID: u8 = 16;
/// Number of scans averaged by [`Config::default`]
pub const DEFAULT_AVERAGED_MEASURES: usize = 8;

const CHANNEL_FIELD_MASK: u32 = 0x1f;

/// Converter instances. The numbering follows the reference manuals.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Instance {
    Adc1,
    Adc2,
    Adc3,
    Adc4,
}

/// Data resolution the converter was configured with
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Resolution {
    SixBit,
    EightBit,
    TenBit,
    TwelveBit,
    SixteenBit,
}

impl Resolution {
    /// Highest code the converter can produce with this resolution
    #[inline]
    pub const fn max_code(self) -> u16 {
        match self {
            Resolution::SixBit => 0x3f,
            Resolution::EightBit => 0xff,
            Resolution::TenBit => 0x3ff,
            Resolution::TwelveBit => 0xfff,
            Resolution::SixteenBit => 0xffff,
        }
    }
}

/// Shape of the self-calibration call offered by a device family
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationMode {
    /// Calibration without arguments (F1)
    Plain,
    /// Calibration of the single-ended input path (F3, G4)
    SingleEnded,
}

/// Scan sequence registers. The discriminant is the index into the word array returned by
/// [`Converter::sequence_registers`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SequenceRegister {
    Sqr1 = 0,
    Sqr2 = 1,
    Sqr3 = 2,
    Sqr4 = 3,
}

/// Position of the sequence length and of every rank's 5-bit channel field inside the scan
/// sequence registers
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SequenceLayout {
    pub length_register: SequenceRegister,
    pub length_offset: u8,
    /// Mask applied after shifting. The register holds the number of conversions minus one.
    pub length_mask: u32,
    /// Register and bit offset of the channel field, indexed by rank
    pub ranks: [(SequenceRegister, u8); MAX_CONVERSIONS],
}

/// Families with three sequence registers (F1, F2, F4). The fields are packed on a 5-bit pitch
/// starting with rank 1 in SQR3.
pub const THREE_REGISTER_LAYOUT: SequenceLayout = SequenceLayout {
    length_register: SequenceRegister::Sqr1,
    length_offset: 20,
    length_mask: 0xf,
    ranks: [
        (SequenceRegister::Sqr3, 0),
        (SequenceRegister::Sqr3, 5),
        (SequenceRegister::Sqr3, 10),
        (SequenceRegister::Sqr3, 15),
        (SequenceRegister::Sqr3, 20),
        (SequenceRegister::Sqr3, 25),
        (SequenceRegister::Sqr2, 0),
        (SequenceRegister::Sqr2, 5),
        (SequenceRegister::Sqr2, 10),
        (SequenceRegister::Sqr2, 15),
        (SequenceRegister::Sqr2, 20),
        (SequenceRegister::Sqr2, 25),
        (SequenceRegister::Sqr1, 0),
        (SequenceRegister::Sqr1, 5),
        (SequenceRegister::Sqr1, 10),
        (SequenceRegister::Sqr1, 15),
    ],
};

/// Families with four sequence registers (F3, G4). The length sits in the low nibble of SQR1
/// and the fields are placed on a 6-bit pitch.
pub const FOUR_REGISTER_LAYOUT: SequenceLayout = SequenceLayout {
    length_register: SequenceRegister::Sqr1,
    length_offset: 0,
    length_mask: 0xf,
    ranks: [
        (SequenceRegister::Sqr1, 6),
        (SequenceRegister::Sqr1, 12),
        (SequenceRegister::Sqr1, 18),
        (SequenceRegister::Sqr1, 24),
        (SequenceRegister::Sqr2, 0),
        (SequenceRegister::Sqr2, 6),
        (SequenceRegister::Sqr2, 12),
        (SequenceRegister::Sqr2, 18),
        (SequenceRegister::Sqr2, 24),
        (SequenceRegister::Sqr3, 0),
        (SequenceRegister::Sqr3, 6),
        (SequenceRegister::Sqr3, 12),
        (SequenceRegister::Sqr3, 18),
        (SequenceRegister::Sqr3, 24),
        (SequenceRegister::Sqr4, 0),
        (SequenceRegister::Sqr4, 6),
    ],
};

/// Capabilities of a device family. Resolved once at startup instead of compiling one driver per
/// family.
#[derive(Debug, Clone, Copy)]
pub struct HardwareFamily {
    /// `None` if the family has no self-calibration
    pub calibration: Option<CalibrationMode>,
    pub layout: &'static SequenceLayout,
    /// Converter which owns the interleaved transfer in dual mode
    pub multimode_master: Instance,
    /// Wait before calibration so the internal regulator is stable
    pub settle_us: u32,
}

impl HardwareFamily {
    pub const STM32F1: HardwareFamily = HardwareFamily {
        calibration: Some(CalibrationMode::Plain),
        layout: &THREE_REGISTER_LAYOUT,
        multimode_master: Instance::Adc1,
        // t_STAB, STM32F103 datasheet
        settle_us: 1,
    };
    pub const STM32F2: HardwareFamily = HardwareFamily {
        calibration: None,
        layout: &THREE_REGISTER_LAYOUT,
        multimode_master: Instance::Adc1,
        settle_us: 0,
    };
    pub const STM32F3: HardwareFamily = HardwareFamily {
        calibration: Some(CalibrationMode::SingleEnded),
        layout: &FOUR_REGISTER_LAYOUT,
        multimode_master: Instance::Adc1,
        // t_ADCVREG_STUP, STM32F303 datasheet
        settle_us: 10,
    };
    pub const STM32F4: HardwareFamily = HardwareFamily {
        calibration: None,
        layout: &THREE_REGISTER_LAYOUT,
        multimode_master: Instance::Adc1,
        settle_us: 0,
    };
    pub const STM32G4: HardwareFamily = HardwareFamily {
        calibration: Some(CalibrationMode::SingleEnded),
        layout: &FOUR_REGISTER_LAYOUT,
        multimode_master: Instance::Adc1,
        // t_ADCVREG_STUP, RM0440
        settle_us: 20,
    };
}

/// Operating state of a converter driver
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConverterState {
    Idle,
    Polling,
    DmaIndependentNormal,
    DmaIndependentCircular,
    DmaDualNormal,
    DmaDualCircular,
}

impl ConverterState {
    #[inline]
    const fn dma(multimode: bool, circular: bool) -> Self {
        match (multimode, circular) {
            (false, false) => ConverterState::DmaIndependentNormal,
            (false, true) => ConverterState::DmaIndependentCircular,
            (true, false) => ConverterState::DmaDualNormal,
            (true, true) => ConverterState::DmaDualCircular,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdcError {
    /// Sequence length or a configured channel is outside of the supported range, or the
    /// averaging window does not fit the buffer
    InvalidConfiguration,
    /// Wrong converter or wrong buffer shape passed
    InvalidParameter,
    ChannelNotFound,
    /// Converted value larger than the maximum code of the configured resolution
    SampleOutOfRange,
    /// Averaging window reaches past the end of the transfer buffer
    IndexOutOfBounds,
    NoConversionInProgress,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    Adc(AdcError),
    /// A start, stop, calibration or transfer primitive of the [`Converter`] failed
    Hardware(E),
}

impl<E> From<AdcError> for Error<E> {
    fn from(other: AdcError) -> Self {
        Error::Adc(other)
    }
}

//==================================================================================================
// Hardware abstraction
//==================================================================================================

/// Capabilities the driver needs from the underlying converter peripheral.
///
/// Mode flags are read back on every operation, so they must reflect the current peripheral
/// configuration.
pub trait Converter {
    type Error;

    fn instance(&self) -> Instance;
    fn is_conversion_running(&self) -> bool;

    fn start(&mut self) -> Result<(), Self::Error>;
    fn stop(&mut self) -> Result<(), Self::Error>;
    /// Start a DMA transfer of independent conversions into `buffer`
    fn start_transfer(&mut self, buffer: &mut [u16]) -> Result<(), Self::Error>;
    /// Start the interleaved DMA transfer of the dual converter pair into `buffer`. Must be
    /// routed to the pair's master if called on the slave.
    fn start_multimode_transfer(&mut self, buffer: &mut [u32]) -> Result<(), Self::Error>;
    fn calibrate(&mut self, mode: CalibrationMode) -> Result<(), Self::Error>;

    /// Result of the next conversion of the running scan sequence. Returns
    /// [`nb::Error::WouldBlock`] until the end of conversion flag is set, and every successful
    /// call advances to the next rank.
    fn read_last_converted(&mut self) -> nb::Result<u16, Self::Error>;
    /// Same as [`Converter::read_last_converted`] for the packed dual mode data register
    fn read_last_multimode_converted(&mut self) -> nb::Result<u32, Self::Error>;

    fn resolution(&self) -> Resolution;
    fn is_dma_enabled(&self) -> bool;
    fn is_multimode_enabled(&self) -> bool;
    fn is_continuous(&self) -> bool;
    fn is_dma_circular(&self) -> bool;
    /// Raw content of SQR1 to SQR4. Families with three registers return 0 for SQR4.
    fn sequence_registers(&self) -> [u32; 4];
}

//==================================================================================================
// Rank table
//==================================================================================================

/// Channel number for every rank of the configured scan sequence
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RankTable {
    ranks: [u8; MAX_CONVERSIONS],
    len: u8,
}

impl Default for RankTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl RankTable {
    pub const fn empty() -> Self {
        RankTable {
            ranks: [0; MAX_CONVERSIONS],
            len: 0,
        }
    }

    /// Decode the scan sequence registers using the given layout.
    ///
    /// Returns [AdcError::InvalidConfiguration] if the sequence length is not within
    /// 1..=[MAX_CONVERSIONS] or if a rank names a channel above [MAX_CHANNEL_ID].
    pub fn decode(layout: &SequenceLayout, registers: &[u32; 4]) -> Result<Self, AdcError> {
        let length_word = registers[layout.length_register as usize];
        let len = ((length_word >> layout.length_offset) & layout.length_mask) as usize + 1;
        if len > MAX_CONVERSIONS {
            return Err(AdcError::InvalidConfiguration);
        }
        let mut table = RankTable::empty();
        for (rank, &(reg, offset)) in layout.ranks.iter().take(len).enumerate() {
            let channel = ((registers[reg as usize] >> offset) & CHANNEL_FIELD_MASK) as u8;
            if channel > MAX_CHANNEL_ID {
                return Err(AdcError::InvalidConfiguration);
            }
            table.ranks[rank] = channel;
        }
        table.len = len as u8;
        Ok(table)
    }

    /// Rank at which `channel` is converted. The first rank wins if the channel appears more
    /// than once.
    pub fn rank_of(&self, channel: u8) -> Result<u8, AdcError> {
        if channel > MAX_CHANNEL_ID {
            return Err(AdcError::ChannelNotFound);
        }
        let rank = self
            .channels()
            .iter()
            .position(|&ch| ch == channel)
            .ok_or(AdcError::ChannelNotFound)?;
        if rank >= MAX_CONVERSIONS {
            return Err(AdcError::ChannelNotFound);
        }
        Ok(rank as u8)
    }

    #[inline]
    pub fn channel_at(&self, rank: u8) -> Option<u8> {
        self.channels().get(rank as usize).copied()
    }

    /// Channels in scan order
    #[inline]
    pub fn channels(&self) -> &[u8] {
        &self.ranks[..self.len as usize]
    }

    /// Number of conversions per scan
    #[inline]
    pub fn len(&self) -> u8 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

//==================================================================================================
// Transfer buffers
//==================================================================================================

/// Destination of the DMA transfer. The shape has to match the converter mode.
pub enum TransferBuffer<const N: usize> {
    Independent(IndependentBuffer<N>),
    Multimode(MultimodeBuffer<N>),
}

impl<const N: usize> TransferBuffer<N> {
    pub const fn independent() -> Self {
        TransferBuffer::Independent(IndependentBuffer { samples: [0; N] })
    }

    pub const fn multimode() -> Self {
        TransferBuffer::Multimode(MultimodeBuffer {
            words: [0; N],
            master: [0; N],
            slave: [0; N],
        })
    }
}

pub struct IndependentBuffer<const N: usize> {
    samples: [u16; N],
}

impl<const N: usize> IndependentBuffer<N> {
    #[inline]
    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    /// Memory handed to the transfer
    #[inline]
    pub fn samples_mut(&mut self) -> &mut [u16] {
        &mut self.samples
    }
}

/// Dual mode buffer. Each word holds the master sample in the upper and the slave sample in the
/// lower half-word. The per-converter streams are refreshed by [`MultimodeBuffer::demultiplex`].
pub struct MultimodeBuffer<const N: usize> {
    words: [u32; N],
    master: [u16; N],
    slave: [u16; N],
}

impl<const N: usize> MultimodeBuffer<N> {
    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Memory handed to the transfer
    #[inline]
    pub fn words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }

    /// Master samples as of the last [`MultimodeBuffer::demultiplex`] call
    #[inline]
    pub fn master(&self) -> &[u16] {
        &self.master
    }

    /// Slave samples as of the last [`MultimodeBuffer::demultiplex`] call
    #[inline]
    pub fn slave(&self) -> &[u16] {
        &self.slave
    }

    pub fn demultiplex(&mut self) {
        demultiplex(&self.words, &mut self.master, &mut self.slave);
    }
}

/// Split packed dual mode words into master (upper 16 bits) and slave (lower 16 bits) samples.
///
/// # Panics
///
/// Debug-asserts that all slices have the same length.
pub fn demultiplex(words: &[u32], master: &mut [u16], slave: &mut [u16]) {
    debug_assert_eq!(words.len(), master.len());
    debug_assert_eq!(words.len(), slave.len());

    for ((word, m), s) in words.iter().zip(master.iter_mut()).zip(slave.iter_mut()) {
        *m = (word >> 16) as u16;
        *s = *word as u16;
    }
}

/// Average of one channel over the last `window` scans in a transfer buffer.
///
/// The transfer writes all ranks of a scan back to back, so the sample of scan `k` for a channel
/// at `rank` sits at `k * conversions + rank`. The sum is divided by `window` with truncation.
/// Returns [AdcError::IndexOutOfBounds] if the window reaches past the end of `samples`.
pub fn average(
    samples: &[u16],
    rank: u8,
    conversions: u8,
    window: usize,
) -> Result<u16, AdcError> {
    if window == 0 {
        return Err(AdcError::InvalidConfiguration);
    }
    let mut sum: u64 = 0;
    for scan in 0..window {
        let idx = scan * conversions as usize + rank as usize;
        sum += *samples.get(idx).ok_or(AdcError::IndexOutOfBounds)? as u64;
    }
    Ok((sum / window as u64) as u16)
}

//==================================================================================================
// Driver
//==================================================================================================

/// Driver settings which are not read back from the hardware
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Config {
    /// Number of most recent scans averaged per DMA read. Must lie in 1..=N.
    pub averaged_measures: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            averaged_measures: DEFAULT_AVERAGED_MEASURES,
        }
    }
}

struct InternalCfg {
    ranks: RankTable,
    state: ConverterState,
    averaged_measures: usize,
    /// Rank of the next result delivered by the data register in polling mode
    scan_position: u8,
}

pub struct ScanAdc<ADC, const N: usize> {
    adc: ADC,
    family: &'static HardwareFamily,
    cfg: InternalCfg,
}

impl<E, ADC, const N: usize> ScanAdc<ADC, N>
where
    ADC: Converter<Error = E>,
{
    /// Create a new driver in the [ConverterState::Idle] state. Nothing is written to the
    /// converter until [`ScanAdc::initialize`] is called.
    pub fn new(
        adc: ADC,
        family: &'static HardwareFamily,
        config: Config,
    ) -> Result<Self, Error<E>> {
        if config.averaged_measures == 0 || config.averaged_measures > N {
            return Err(Error::Adc(AdcError::InvalidConfiguration));
        }
        Ok(ScanAdc {
            adc,
            family,
            cfg: InternalCfg {
                ranks: RankTable::empty(),
                state: ConverterState::Idle,
                averaged_measures: config.averaged_measures,
                scan_position: 0,
            },
        })
    }

    #[inline]
    pub fn state(&self) -> ConverterState {
        self.cfg.state
    }

    #[inline]
    pub fn rank_table(&self) -> &RankTable {
        &self.cfg.ranks
    }

    #[inline]
    pub fn family(&self) -> &'static HardwareFamily {
        self.family
    }

    /// Release the converter
    pub fn free(self) -> ADC {
        self.adc
    }

    #[inline]
    fn is_multimode_master(&self) -> bool {
        self.adc.instance() == self.family.multimode_master
    }

    fn calibrate(&mut self, delay: &mut impl DelayNs) -> Result<(), Error<E>> {
        if let Some(mode) = self.family.calibration {
            delay.delay_us(self.family.settle_us);
            self.adc.calibrate(mode).map_err(Error::Hardware)?;
            trace!("calibration done: {}", mode);
        }
        Ok(())
    }

    /// Calibrate and start the converter, then read back the scan sequence.
    ///
    /// A running converter is stopped first. With DMA enabled in independent mode, the transfer
    /// into `buffer` is started, which then has to be [TransferBuffer::independent]. In dual mode
    /// the converter is left stopped and the transfer is started by
    /// [`ScanAdc::initialize_multimode`] on the master.
    pub fn initialize(
        &mut self,
        buffer: &mut TransferBuffer<N>,
        delay: &mut impl DelayNs,
    ) -> Result<(), Error<E>> {
        let dma = self.adc.is_dma_enabled();
        let multimode = self.adc.is_multimode_enabled();
        if dma && !multimode && !matches!(buffer, TransferBuffer::Independent(_)) {
            return Err(Error::Adc(AdcError::InvalidParameter));
        }

        if self.adc.is_conversion_running() {
            self.adc.stop().map_err(Error::Hardware)?;
        }
        self.cfg.state = ConverterState::Idle;
        self.calibrate(delay)?;
        self.adc.start().map_err(Error::Hardware)?;
        self.cfg.scan_position = 0;
        self.cfg.ranks = RankTable::decode(self.family.layout, &self.adc.sequence_registers())?;
        debug!(
            "{} ranks decoded: {}",
            self.cfg.ranks.len(),
            self.cfg.ranks.channels()
        );

        let state = if !dma {
            ConverterState::Polling
        } else if multimode {
            self.adc.stop().map_err(Error::Hardware)?;
            ConverterState::dma(true, self.adc.is_dma_circular())
        } else {
            if let TransferBuffer::Independent(buf) = buffer {
                self.adc
                    .start_transfer(buf.samples_mut())
                    .map_err(Error::Hardware)?;
            }
            ConverterState::dma(false, self.adc.is_dma_circular())
        };
        self.cfg.state = state;
        debug!("initialized: {}", state);
        Ok(())
    }

    /// Start the interleaved dual mode transfer into `buffer`. Needs to be called on the master
    /// after both converters were set up with [`ScanAdc::initialize`].
    ///
    /// Returns [AdcError::InvalidParameter] if this converter is not the multimode master of
    /// its family or if `buffer` is not a [TransferBuffer::multimode] buffer.
    pub fn initialize_multimode(
        &mut self,
        buffer: &mut TransferBuffer<N>,
        delay: &mut impl DelayNs,
    ) -> Result<(), Error<E>> {
        if !self.is_multimode_master() {
            return Err(Error::Adc(AdcError::InvalidParameter));
        }
        let TransferBuffer::Multimode(buf) = buffer else {
            return Err(Error::Adc(AdcError::InvalidParameter));
        };
        self.calibrate(delay)?;
        self.adc
            .start_multimode_transfer(buf.words_mut())
            .map_err(Error::Hardware)?;
        self.cfg.state = ConverterState::dma(true, self.adc.is_dma_circular());
        debug!("multimode transfer started: {}", self.cfg.state);
        Ok(())
    }

    /// Stop conversions and return to [ConverterState::Idle]
    pub fn stop(&mut self) -> Result<(), Error<E>> {
        self.adc.stop().map_err(Error::Hardware)?;
        self.cfg.state = ConverterState::Idle;
        debug!("stopped");
        Ok(())
    }

    /// Read the raw value of `channel`.
    ///
    /// In polling mode the data register is read until the channel's rank was converted. In DMA
    /// mode the value is the average over the last [`Config::averaged_measures`] scans in
    /// `buffer`. Conversions or transfers which do not restart by themselves are re-armed
    /// before returning.
    pub fn read_channel(
        &mut self,
        buffer: &mut TransferBuffer<N>,
        channel: u8,
    ) -> Result<u16, Error<E>> {
        if self.cfg.state == ConverterState::Idle || !self.adc.is_conversion_running() {
            return Err(Error::Adc(AdcError::NoConversionInProgress));
        }
        let rank = self.cfg.ranks.rank_of(channel)?;
        let conversions = self.cfg.ranks.len();
        let window = self.cfg.averaged_measures;

        let value = match self.cfg.state {
            ConverterState::Idle => return Err(Error::Adc(AdcError::NoConversionInProgress)),
            ConverterState::Polling => self.read_polled(rank)?,
            ConverterState::DmaIndependentNormal | ConverterState::DmaIndependentCircular => {
                let TransferBuffer::Independent(buf) = buffer else {
                    return Err(Error::Adc(AdcError::InvalidParameter));
                };
                average(buf.samples(), rank, conversions, window)?
            }
            ConverterState::DmaDualNormal | ConverterState::DmaDualCircular => {
                let TransferBuffer::Multimode(buf) = buffer else {
                    return Err(Error::Adc(AdcError::InvalidParameter));
                };
                buf.demultiplex();
                let samples = if self.is_multimode_master() {
                    buf.master()
                } else {
                    buf.slave()
                };
                average(samples, rank, conversions, window)?
            }
        };
        self.rearm(buffer)?;
        Ok(value)
    }

    /// Read `channel` and scale it linearly so that the maximum code maps to `full_scale`
    pub fn read_scaled(
        &mut self,
        buffer: &mut TransferBuffer<N>,
        full_scale: f32,
        channel: u8,
    ) -> Result<f32, Error<E>> {
        let max_code = self.adc.resolution().max_code();
        let raw = self.read_channel(buffer, channel)?;
        Ok(full_scale * raw as f32 / max_code as f32)
    }

    /// Consume conversion results until the one of `rank` was read. The scan position carries
    /// over between reads, so a read may wrap into the next scan cycle.
    fn read_polled(&mut self, rank: u8) -> Result<u16, Error<E>> {
        let max_code = self.adc.resolution().max_code();
        for _ in 0..self.cfg.ranks.len() {
            let position = self.cfg.scan_position;
            let sample = self.next_polled()?;
            if sample > max_code {
                warn!("rank {} out of range: {}", position, sample);
                return Err(Error::Adc(AdcError::SampleOutOfRange));
            }
            if position == rank {
                return Ok(sample);
            }
        }
        // Every rank below the sequence length comes around within one scan
        Err(Error::Adc(AdcError::ChannelNotFound))
    }

    /// Block until the next end of conversion and advance the scan position. In dual mode this
    /// converter's half of the packed result is returned.
    fn next_polled(&mut self) -> Result<u16, Error<E>> {
        let sample = if self.adc.is_multimode_enabled() {
            let word =
                nb::block!(self.adc.read_last_multimode_converted()).map_err(Error::Hardware)?;
            if self.is_multimode_master() {
                (word >> 16) as u16
            } else {
                word as u16
            }
        } else {
            nb::block!(self.adc.read_last_converted()).map_err(Error::Hardware)?
        };
        self.cfg.scan_position = (self.cfg.scan_position + 1) % self.cfg.ranks.len();
        Ok(sample)
    }

    fn rearm(&mut self, buffer: &mut TransferBuffer<N>) -> Result<(), Error<E>> {
        match (self.cfg.state, buffer) {
            (ConverterState::Polling, _) if !self.adc.is_continuous() => {
                // A single scan runs to its end, so its remaining results are read first
                while self.cfg.scan_position != 0 {
                    self.next_polled()?;
                }
                self.adc.start().map_err(Error::Hardware)?;
            }
            (ConverterState::DmaIndependentNormal, TransferBuffer::Independent(buf)) => {
                self.adc
                    .start_transfer(buf.samples_mut())
                    .map_err(Error::Hardware)?;
            }
            (ConverterState::DmaDualNormal, TransferBuffer::Multimode(buf)) => {
                self.adc
                    .start_multimode_transfer(buf.words_mut())
                    .map_err(Error::Hardware)?;
            }
            _ => return Ok(()),
        }
        trace!("re-armed: {}", self.cfg.state);
        Ok(())
    }
}
