use crate::models::Status;

/// RGB triple; the terminal front end turns it into a true-colour value.
pub type Rgb = (u8, u8, u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardStyle {
    pub background: Option<Rgb>,
    pub border_width: u8,
    pub border: Rgb,
}

pub const DUE_STYLE: CardStyle = CardStyle {
    background: Some((0xf0, 0xf0, 0xf0)),
    border_width: 1,
    border: (0xcc, 0xcc, 0xcc),
};

pub const DONE_STYLE: CardStyle = CardStyle {
    background: Some((0xe6, 0xff, 0xe6)),
    border_width: 1,
    border: (0x99, 0xcc, 0x99),
};

pub const LATE_STYLE: CardStyle = CardStyle {
    background: Some((0xff, 0xe6, 0xe6)),
    border_width: 1,
    border: (0xff, 0x99, 0x99),
};

pub const FALLBACK_STYLE: CardStyle = CardStyle {
    background: None,
    border_width: 1,
    border: (0xdd, 0xdd, 0xdd),
};

pub fn status_style(status: &Status) -> CardStyle {
    match status {
        Status::Due => DUE_STYLE,
        Status::Done => DONE_STYLE,
        Status::Late => LATE_STYLE,
        Status::Other(_) => FALLBACK_STYLE,
    }
}
