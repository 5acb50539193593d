//! CBIOS function table.
//!
//! The CBIOS jump table lives at `addr::CBIOS..addr::CBIOS + 17*3`: 17
//! three-byte-aligned `RET` stubs, one per entry point, in the standard
//! CP/M 2.2 order. A trapped PC's function index is `(pc - CBIOS) / 3`.

use crate::bdos::addr;

/// One CBIOS jump-table entry point, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CbiosFunction {
    Boot = 0,
    WarmBoot = 1,
    ConsoleStatus = 2,
    ConsoleInput = 3,
    ConsoleOutput = 4,
    ListOutput = 5,
    Punch = 6,
    Reader = 7,
    Home = 8,
    SelectDisk = 9,
    SetTrack = 10,
    SetSector = 11,
    SetDma = 12,
    Read = 13,
    Write = 14,
    ListStatus = 15,
    SectorTranslate = 16,
}

impl TryFrom<u8> for CbiosFunction {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CbiosFunction::*;
        match value {
            0 => Ok(Boot),
            1 => Ok(WarmBoot),
            2 => Ok(ConsoleStatus),
            3 => Ok(ConsoleInput),
            4 => Ok(ConsoleOutput),
            5 => Ok(ListOutput),
            6 => Ok(Punch),
            7 => Ok(Reader),
            8 => Ok(Home),
            9 => Ok(SelectDisk),
            10 => Ok(SetTrack),
            11 => Ok(SetSector),
            12 => Ok(SetDma),
            13 => Ok(Read),
            14 => Ok(Write),
            15 => Ok(ListStatus),
            16 => Ok(SectorTranslate),
            _ => Err(value),
        }
    }
}

impl CbiosFunction {
    /// Table byte offset (3 bytes per entry) of this function, from `addr::CBIOS`.
    pub fn offset(self) -> u16 {
        self as u16 * 3
    }

    /// Map a trapped PC to its CBIOS function, if it falls within the
    /// 17-entry table (`CBIOS..CBIOS + 17*3`) and lands on an entry boundary.
    pub fn from_pc(pc: u16) -> Option<Self> {
        if pc < addr::CBIOS {
            return None;
        }
        let offset = pc - addr::CBIOS;
        if offset >= 17 * 3 || offset % 3 != 0 {
            return None;
        }
        Self::try_from((offset / 3) as u8).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pc_entries() {
        assert_eq!(CbiosFunction::from_pc(addr::CBIOS), Some(CbiosFunction::Boot));
        assert_eq!(
            CbiosFunction::from_pc(addr::CBIOS + 3),
            Some(CbiosFunction::WarmBoot)
        );
        assert_eq!(
            CbiosFunction::from_pc(addr::CBIOS + 9),
            Some(CbiosFunction::ConsoleOutput)
        );
        assert_eq!(
            CbiosFunction::from_pc(addr::CBIOS + 16 * 3),
            Some(CbiosFunction::SectorTranslate)
        );
    }

    #[test]
    fn test_from_pc_out_of_range() {
        assert_eq!(CbiosFunction::from_pc(addr::CBIOS - 1), None);
        assert_eq!(CbiosFunction::from_pc(addr::CBIOS + 17 * 3), None);
        assert_eq!(CbiosFunction::from_pc(0xFFFF), None);
    }

    #[test]
    fn test_from_pc_unaligned() {
        assert_eq!(CbiosFunction::from_pc(addr::CBIOS + 1), None);
        assert_eq!(CbiosFunction::from_pc(addr::CBIOS + 2), None);
    }

    #[test]
    fn test_offset_roundtrip() {
        for func in [CbiosFunction::Boot, CbiosFunction::Read, CbiosFunction::SectorTranslate] {
            let pc = addr::CBIOS + func.offset();
            assert_eq!(CbiosFunction::from_pc(pc), Some(func));
        }
    }
}
