//! Register and coil banks (§3): the Modbus-addressable views onto the
//! process image and the fixed configuration/diagnostic data.
//!
//! Output banks (`PD-OUT-1/2`, `COIL-OUT-1/2`) share one mutex — the
//! "write-mapping mutex" of §5 — since the dispatcher (producer), the
//! cycle engine (consumer, via [`gw_runtime::BankSync`]), and the watchdog
//! (zeroing on expiry) all touch them. Input banks (`PD-IN-1/2`,
//! `COIL-IN-1/2`) are lock-free: the cycle engine is their sole writer and
//! dispatcher reads tolerate word-granular tearing, per §5.

use gw_fieldbus::TerminalInfo;
use gw_runtime::BankSync;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Mutex;

const PD_IN_1_LEN: usize = 256;
const PD_OUT_1_LEN: usize = 256;
const PD_IN_2_LEN: usize = 764; // 0x6000..=0x62FB
const PD_OUT_2_LEN: usize = 764; // 0x7000..=0x72FB
const COIL_1_BITS: usize = 512;
const COIL_2_BITS: usize = 1528; // 0x8000..=0x85F7
const COIL_2_BYTES: usize = (COIL_2_BITS + 7) / 8;

const ASSEMBLY_CAPACITIES: [usize; 4] = [65, 64, 64, 63];
const COUPLER_IDENTIFIER: u16 = 352;

/// A register-addressable target within the dispatcher's routing tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterTarget {
    PdIn1,
    PdOut1,
    PdIn2,
    PdOut2,
    Watchdog,
    KbusInfo,
    Mac,
    Const,
    Descr,
    Assembly(usize),
}

/// A coil-addressable target (bit granularity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoilTarget {
    CoilOut1,
    CoilIn1,
    CoilOut2,
    CoilIn2,
}

/// Route a register address (FC 0x03/0x04/0x42/0x17's read half) to a bank
/// and local index.
///
/// `[SUPPLEMENT]` Deliberately a single table shared between reads and
/// writes for the windows that are write-capable (`PD-OUT-1/2`): this is
/// the mechanism behind the "read-mapping returns the write bank" quirk
/// documented for those windows — there is no separate PD-IN alias there,
/// reading simply observes the output bank directly, matching the original
/// firmware's shared `get{Read,Write}Mapping` table.
#[must_use]
pub fn route_register_read(addr: u16) -> Option<(RegisterTarget, usize)> {
    match addr {
        0x0000..=0x00FF => Some((RegisterTarget::PdIn1, addr as usize)),
        0x0200..=0x02FF => Some((RegisterTarget::PdOut1, (addr - 0x0200) as usize)),
        0x6000..=0x62FB => Some((RegisterTarget::PdIn2, (addr - 0x6000) as usize)),
        0x7000..=0x72FB => Some((RegisterTarget::PdOut2, (addr - 0x7000) as usize)),
        0x1000..=0x100B => Some((RegisterTarget::Watchdog, (addr - 0x1000) as usize)),
        0x1022..=0x1025 => Some((RegisterTarget::KbusInfo, (addr - 0x1022) as usize)),
        0x1031..=0x1033 => Some((RegisterTarget::Mac, (addr - 0x1031) as usize)),
        0x2000..=0x2008 => Some((RegisterTarget::Const, (addr - 0x2000) as usize)),
        0x2020..=0x202F => Some((RegisterTarget::Descr, (addr - 0x2020) as usize)),
        0x2030 => Some((RegisterTarget::Assembly(0), 0)),
        0x2031 => Some((RegisterTarget::Assembly(1), 0)),
        0x2032 => Some((RegisterTarget::Assembly(2), 0)),
        0x2033 => Some((RegisterTarget::Assembly(3), 0)),
        _ => None,
    }
}

/// Route a register address for a write (FC 0x06/0x10/0x16/0x17's write
/// half). Only `PD-OUT-1/2` and `WATCHDOG` are write-capable; everything
/// else (including `PD-IN-*` and the fixed configuration banks) is
/// read-only and yields `None` here, which the dispatcher turns into
/// `ILLEGAL_DATA_ADDRESS`.
#[must_use]
pub fn route_register_write(addr: u16) -> Option<(RegisterTarget, usize)> {
    match addr {
        0x0200..=0x02FF => Some((RegisterTarget::PdOut1, (addr - 0x0200) as usize)),
        0x7000..=0x72FB => Some((RegisterTarget::PdOut2, (addr - 0x7000) as usize)),
        0x1000..=0x100B => Some((RegisterTarget::Watchdog, (addr - 0x1000) as usize)),
        _ => None,
    }
}

/// Route a coil address for FC 0x01 (read) / 0x05 / 0x0F (write): the
/// `COIL-OUT-*` banks, including the 512-bit and 1 0x1000-word mirrors.
#[must_use]
pub fn route_coil_out(addr: u16) -> Option<(CoilTarget, usize)> {
    match addr as usize {
        0..=511 => Some((CoilTarget::CoilOut1, addr as usize)),
        512..=1023 => Some((CoilTarget::CoilOut1, addr as usize - 512)),
        0x8000..=0x85F7 => Some((CoilTarget::CoilOut2, addr as usize - 0x8000)),
        0x9000..=0x95F7 => Some((CoilTarget::CoilOut2, addr as usize - 0x9000)),
        _ => None,
    }
}

/// Route a coil address for FC 0x02 (read discrete inputs): the
/// `COIL-IN-*` banks.
#[must_use]
pub fn route_coil_in(addr: u16) -> Option<(CoilTarget, usize)> {
    match addr as usize {
        0..=511 => Some((CoilTarget::CoilIn1, addr as usize)),
        0x8000..=0x85F7 => Some((CoilTarget::CoilIn2, addr as usize - 0x8000)),
        _ => None,
    }
}

/// Lock-free bit array: the cycle engine is the sole writer, dispatcher
/// reads tolerate byte-granular tearing.
struct AtomicBits {
    bytes: Vec<AtomicU8>,
}

impl AtomicBits {
    fn new(bits: usize) -> Self {
        let n = (bits + 7) / 8;
        Self {
            bytes: (0..n).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    fn get(&self, bit: usize) -> bool {
        let byte = self.bytes[bit / 8].load(Ordering::Acquire);
        (byte >> (bit % 8)) & 1 != 0
    }

    fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Acquire)).collect()
    }

    fn store_bytes(&self, src: &[u8]) {
        for (dst, &b) in self.bytes.iter().zip(src.iter()) {
            dst.store(b, Ordering::Release);
        }
    }
}

/// Lock-free word array, mirroring [`AtomicBits`] for the register-sized
/// input banks.
struct AtomicWords {
    words: Vec<AtomicU16>,
}

impl AtomicWords {
    fn new(len: usize) -> Self {
        Self {
            words: (0..len).map(|_| AtomicU16::new(0)).collect(),
        }
    }

    fn get(&self, idx: usize) -> u16 {
        self.words[idx].load(Ordering::Acquire)
    }

    fn store_from_bytes(&self, src: &[u8]) {
        for (i, w) in self.words.iter().enumerate() {
            let lo = i * 2;
            if lo + 1 >= src.len() {
                break;
            }
            w.store(u16::from_be_bytes([src[lo], src[lo + 1]]), Ordering::Release);
        }
    }
}

/// All output banks, guarded by one mutex (the write-mapping mutex).
struct OutputBanks {
    pd_out_1: Vec<u16>,
    pd_out_2: Vec<u16>,
    coil_out_1: Vec<u8>, // bit-packed, COIL_1_BITS bits
    coil_out_2: Vec<u8>, // bit-packed, COIL_2_BITS bits
}

impl OutputBanks {
    fn new() -> Self {
        Self {
            pd_out_1: vec![0; PD_OUT_1_LEN],
            pd_out_2: vec![0; PD_OUT_2_LEN],
            coil_out_1: vec![0; COIL_1_BITS / 8],
            coil_out_2: vec![0; COIL_2_BYTES],
        }
    }

    fn zero(&mut self) {
        self.pd_out_1.iter_mut().for_each(|w| *w = 0);
        self.pd_out_2.iter_mut().for_each(|w| *w = 0);
        self.coil_out_1.iter_mut().for_each(|b| *b = 0);
        self.coil_out_2.iter_mut().for_each(|b| *b = 0);
    }
}

fn get_bit(bytes: &[u8], bit: usize) -> bool {
    (bytes[bit / 8] >> (bit % 8)) & 1 != 0
}

fn set_bit(bytes: &mut [u8], bit: usize, value: bool) {
    let mask = 1u8 << (bit % 8);
    if value {
        bytes[bit / 8] |= mask;
    } else {
        bytes[bit / 8] &= !mask;
    }
}

/// All Modbus-addressable banks for one gateway instance.
pub struct GatewayBanks {
    pd_in_1: AtomicWords,
    pd_in_2: AtomicWords,
    coil_in_1: AtomicBits,
    coil_in_2: AtomicBits,
    output: Mutex<OutputBanks>,

    kbus_info: Mutex<[u16; 4]>,
    mac: Mutex<[u16; 3]>,
    assembly: Mutex<[Vec<u16>; 4]>,
    descr: [u16; 16],
    digital_in_byte_offset: Mutex<usize>,
    digital_out_byte_offset: Mutex<usize>,
}

const CONST_BANK: [u16; 9] = [
    0x0000, 0xFFFF, 0x1234, 0xAAAA, 0x5555, 0x7FFF, 0x8000, 0x3FFF, 0x4000,
];

impl GatewayBanks {
    /// Build the banks. `descr_suffix` is appended to `"MODBUSPFCSLAVE-"`
    /// (the crate version, in production).
    #[must_use]
    pub fn new(descr_suffix: &str) -> Self {
        Self {
            pd_in_1: AtomicWords::new(PD_IN_1_LEN),
            pd_in_2: AtomicWords::new(PD_IN_2_LEN),
            coil_in_1: AtomicBits::new(COIL_1_BITS),
            coil_in_2: AtomicBits::new(COIL_2_BITS),
            output: Mutex::new(OutputBanks::new()),
            kbus_info: Mutex::new([0; 4]),
            mac: Mutex::new(mac_words_from_nic()),
            assembly: Mutex::new([
                vec![0; ASSEMBLY_CAPACITIES[0]],
                vec![0; ASSEMBLY_CAPACITIES[1]],
                vec![0; ASSEMBLY_CAPACITIES[2]],
                vec![0; ASSEMBLY_CAPACITIES[3]],
            ]),
            descr: build_descr_bank(descr_suffix),
            digital_in_byte_offset: Mutex::new(0),
            digital_out_byte_offset: Mutex::new(0),
        }
    }

    /// The digital-output byte offset recorded by the most recent
    /// [`BankSync::map_write_coils_to_pd_out`] call — where the COIL-OUT-1
    /// byte view aliases into PD-OUT-1 (§5).
    #[must_use]
    pub fn digital_out_byte_offset(&self) -> usize {
        *self.digital_out_byte_offset.lock().unwrap()
    }

    /// The digital-input byte offset recorded by the most recent
    /// [`BankSync::map_pd_in_to_read_coils`] call — where COIL-IN-1 aliases
    /// into PD-IN (§5).
    #[must_use]
    pub fn digital_in_byte_offset(&self) -> usize {
        *self.digital_in_byte_offset.lock().unwrap()
    }

    /// Read one register word for FC 0x03/0x04/0x42/0x17-read. `None` for
    /// an out-of-range local index.
    #[must_use]
    pub fn read_register(&self, target: RegisterTarget, idx: usize) -> Option<u16> {
        match target {
            RegisterTarget::PdIn1 => self.pd_in_1.words.get(idx).map(|w| w.load(Ordering::Acquire)),
            RegisterTarget::PdIn2 => self.pd_in_2.words.get(idx).map(|w| w.load(Ordering::Acquire)),
            RegisterTarget::PdOut1 => self.output.lock().unwrap().pd_out_1.get(idx).copied(),
            RegisterTarget::PdOut2 => self.output.lock().unwrap().pd_out_2.get(idx).copied(),
            RegisterTarget::KbusInfo => self.kbus_info.lock().unwrap().get(idx).copied(),
            RegisterTarget::Mac => self.mac.lock().unwrap().get(idx).copied(),
            RegisterTarget::Const => CONST_BANK.get(idx).copied(),
            RegisterTarget::Descr => self.descr.get(idx).copied(),
            RegisterTarget::Assembly(slab) => {
                let assembly = self.assembly.lock().unwrap();
                assembly[slab].get(idx).copied()
            }
            RegisterTarget::Watchdog => None, // handled by WatchdogBank directly
        }
    }

    /// Bank capacity in words, for bounds-checking multi-register reads
    /// that start mid-bank.
    #[must_use]
    pub fn capacity(&self, target: RegisterTarget) -> usize {
        match target {
            RegisterTarget::PdIn1 => PD_IN_1_LEN,
            RegisterTarget::PdIn2 => PD_IN_2_LEN,
            RegisterTarget::PdOut1 => PD_OUT_1_LEN,
            RegisterTarget::PdOut2 => PD_OUT_2_LEN,
            RegisterTarget::KbusInfo => 4,
            RegisterTarget::Mac => 3,
            RegisterTarget::Const => CONST_BANK.len(),
            RegisterTarget::Descr => self.descr.len(),
            RegisterTarget::Assembly(slab) => ASSEMBLY_CAPACITIES[slab],
            RegisterTarget::Watchdog => 12,
        }
    }

    /// Write one register word (FC 0x06/0x10/0x17-write; FC 0x16 reads
    /// first via [`GatewayBanks::read_register`]). `WATCHDOG` is never
    /// passed here; the dispatcher routes it to `WatchdogBank` instead.
    pub fn write_register(&self, target: RegisterTarget, idx: usize, value: u16) -> bool {
        match target {
            RegisterTarget::PdOut1 => {
                let mut out = self.output.lock().unwrap();
                match out.pd_out_1.get_mut(idx) {
                    Some(slot) => {
                        *slot = value;
                        true
                    }
                    None => false,
                }
            }
            RegisterTarget::PdOut2 => {
                let mut out = self.output.lock().unwrap();
                match out.pd_out_2.get_mut(idx) {
                    Some(slot) => {
                        *slot = value;
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Read one coil bit for FC 0x01/0x02.
    #[must_use]
    pub fn read_coil(&self, target: CoilTarget, bit: usize) -> Option<bool> {
        match target {
            CoilTarget::CoilOut1 => {
                let out = self.output.lock().unwrap();
                (bit < COIL_1_BITS).then(|| get_bit(&out.coil_out_1, bit))
            }
            CoilTarget::CoilOut2 => {
                let out = self.output.lock().unwrap();
                (bit < COIL_2_BITS).then(|| get_bit(&out.coil_out_2, bit))
            }
            CoilTarget::CoilIn1 => (bit < COIL_1_BITS).then(|| self.coil_in_1.get(bit)),
            CoilTarget::CoilIn2 => (bit < COIL_2_BITS).then(|| self.coil_in_2.get(bit)),
        }
    }

    /// Write one coil bit for FC 0x05/0x0F.
    pub fn write_coil(&self, target: CoilTarget, bit: usize, value: bool) -> bool {
        match target {
            CoilTarget::CoilOut1 if bit < COIL_1_BITS => {
                set_bit(&mut self.output.lock().unwrap().coil_out_1, bit, value);
                true
            }
            CoilTarget::CoilOut2 if bit < COIL_2_BITS => {
                set_bit(&mut self.output.lock().unwrap().coil_out_2, bit, value);
                true
            }
            _ => false,
        }
    }

    /// Coil bank capacity in bits.
    #[must_use]
    pub fn coil_capacity(&self, target: CoilTarget) -> usize {
        match target {
            CoilTarget::CoilOut1 | CoilTarget::CoilIn1 => COIL_1_BITS,
            CoilTarget::CoilOut2 | CoilTarget::CoilIn2 => COIL_2_BITS,
        }
    }

    /// Zero every output bank. Called by the watchdog on expiry and by the
    /// cycle engine when re-entering setup after a bus error.
    pub fn zero_outputs(&self) {
        self.output.lock().unwrap().zero();
    }
}

fn build_descr_bank(version_suffix: &str) -> [u16; 16] {
    let mut s = format!("MODBUSPFCSLAVE-{version_suffix}").into_bytes();
    s.resize(32, 0);
    let mut out = [0u16; 16];
    for (i, word) in out.iter_mut().enumerate() {
        *word = u16::from_be_bytes([s[i * 2], s[i * 2 + 1]]);
    }
    out
}

#[cfg(target_os = "linux")]
fn mac_words_from_nic() -> [u16; 3] {
    use nix::ifaddrs::getifaddrs;
    use nix::sys::socket::SockaddrLike;

    let octets = getifaddrs().ok().into_iter().flatten().find_map(|iface| {
        if iface.interface_name == "lo" {
            return None;
        }
        let link = iface.address?.as_link_addr()?;
        link.addr()
    });

    match octets {
        Some(mac) => pack_mac(mac),
        None => {
            tracing::warn!("no non-loopback interface with a MAC address found, reporting 00:00:00:00:00:00");
            [0, 0, 0]
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn mac_words_from_nic() -> [u16; 3] {
    tracing::warn!("MAC discovery unsupported on this platform, reporting 00:00:00:00:00:00");
    [0, 0, 0]
}

fn pack_mac(octets: [u8; 6]) -> [u16; 3] {
    [
        u16::from_be_bytes([octets[0], octets[1]]),
        u16::from_be_bytes([octets[2], octets[3]]),
        u16::from_be_bytes([octets[4], octets[5]]),
    ]
}

/// [`BankSync`] implementation driving these banks from the KBUS cycle
/// engine.
impl BankSync for GatewayBanks {
    fn copy_banks_to_pd_out(&self, pd_out: &mut [u8]) -> usize {
        let out = self.output.lock().unwrap();
        let mut n = 0;
        for (i, &w) in out.pd_out_1.iter().enumerate() {
            let b = w.to_be_bytes();
            let off = i * 2;
            if off + 1 >= pd_out.len() {
                break;
            }
            pd_out[off..off + 2].copy_from_slice(&b);
            n += 2;
        }
        let base = PD_OUT_1_LEN * 2;
        for (i, &w) in out.pd_out_2.iter().enumerate() {
            let off = base + i * 2;
            if off + 1 >= pd_out.len() {
                break;
            }
            pd_out[off..off + 2].copy_from_slice(&w.to_be_bytes());
            n += 2;
        }
        n
    }

    fn map_write_coils_to_pd_out(&self, pd_out: &mut [u8], digital_out_offset: usize, bytes_to_write: usize) {
        *self.digital_out_byte_offset.lock().unwrap() = digital_out_offset;
        if digital_out_offset + bytes_to_write > pd_out.len() {
            tracing::warn!(
                digital_out_offset,
                bytes_to_write,
                pd_out_len = pd_out.len(),
                "digital output mapping violates the PD image bounds invariant (§8)"
            );
        }
        let out = self.output.lock().unwrap();
        let n = bytes_to_write.saturating_sub(digital_out_offset).min(out.coil_out_1.len());
        for i in 0..n {
            let dst = digital_out_offset + i;
            if dst < pd_out.len() {
                pd_out[dst] = out.coil_out_1[i];
            }
        }
    }

    fn copy_pd_in_to_banks(&self, pd_in: &[u8]) {
        self.pd_in_1.store_from_bytes(pd_in);
        if pd_in.len() > PD_IN_1_LEN * 2 {
            self.pd_in_2.store_from_bytes(&pd_in[PD_IN_1_LEN * 2..]);
        }
    }

    fn map_pd_in_to_read_coils(&self, pd_in: &[u8], digital_in_offset: usize) {
        *self.digital_in_byte_offset.lock().unwrap() = digital_in_offset;
        if digital_in_offset > pd_in.len() {
            tracing::warn!(
                digital_in_offset,
                pd_in_len = pd_in.len(),
                "digital input mapping offset falls outside the PD-IN image"
            );
        }
        let n = (COIL_1_BITS / 8).min(pd_in.len().saturating_sub(digital_in_offset));
        self.coil_in_1.store_bytes(&pd_in[digital_in_offset..digital_in_offset + n]);
    }

    fn zero_output_banks(&self) {
        self.zero_outputs();
    }

    fn publish_topology(&self, terminals: &[TerminalInfo]) {
        let mut analog_out = 0u32;
        let mut analog_in = 0u32;
        let mut digital_out = 0u32;
        let mut digital_in = 0u32;

        let mut assembly = self.assembly.lock().unwrap();
        assembly[0].iter_mut().for_each(|w| *w = 0);
        assembly[1].iter_mut().for_each(|w| *w = 0);
        assembly[2].iter_mut().for_each(|w| *w = 0);
        assembly[3].iter_mut().for_each(|w| *w = 0);
        assembly[0][0] = COUPLER_IDENTIFIER;

        let mut truncated = 0usize;
        for (i, t) in terminals.iter().enumerate() {
            let position = i + 1; // 1-based, terminal ID slot 1..255
            if position > 255 {
                truncated += 1;
                continue;
            }
            // [SUPPLEMENT] terminal 193..255 routes to slab 4, not slab 3
            // (the off-by-one fix, see DESIGN.md). Slab 1 is 1-based (slot 0
            // holds the coupler identifier); slabs 2-4 are 0-based.
            let (slab, slot) = if position <= 64 {
                (0, position)
            } else if position <= 128 {
                (1, position - 65)
            } else if position <= 192 {
                (2, position - 129)
            } else {
                (3, position - 193)
            };
            if slot < assembly[slab].len() {
                assembly[slab][slot] = t.raw_id;
            }

            if t.bit_size_in > 0 {
                if t.family == 0 {
                    digital_in += t.bit_size_in;
                } else {
                    analog_in += t.bit_size_in;
                }
            }
            if t.bit_size_out > 0 {
                if t.family == 0 {
                    digital_out += t.bit_size_out;
                } else {
                    analog_out += t.bit_size_out;
                }
            }
        }
        drop(assembly);

        if truncated > 0 {
            tracing::warn!(truncated, "terminal installation exceeds 255 modules, truncating ASSEMBLY");
        }

        let mut info = self.kbus_info.lock().unwrap();
        info[0] = analog_out.min(u32::from(u16::MAX)) as u16;
        info[1] = analog_in.min(u32::from(u16::MAX)) as u16;
        info[2] = digital_out.min(u32::from(u16::MAX)) as u16;
        info[3] = digital_in.min(u32::from(u16::MAX)) as u16;
    }
}
