/* Host command space. The core never interprets these beyond concatenating
 * a block code with an offset and a flag mask; the host defines the
 * semantics. Encoding: low byte argument, second byte block, flags above. */

/* What a read_command call produced. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /* A host command code. */
    Command(i32),
    /* No key pending. */
    None,
    /* Fatal transport state; the host should close and reopen. */
    Restart,
}

/* Screen-reader mode the host is currently in. Drivers may bind a few
 * keys differently in the preferences menu. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandContext {
    Screen,
    Prefs,
    Message,
}

pub const MSK_ARG: i32 = 0x0000_00FF;
pub const MSK_BLK: i32 = 0x0000_FF00;
pub const MSK_CMD: i32 = MSK_BLK | MSK_ARG;

/* Simple commands (no argument). */
pub const CMD_NOOP: i32 = 0;
pub const CMD_LNUP: i32 = 1;
pub const CMD_LNDN: i32 = 2;
pub const CMD_WINUP: i32 = 3;
pub const CMD_WINDN: i32 = 4;
pub const CMD_PRDIFLN: i32 = 5;
pub const CMD_NXDIFLN: i32 = 6;
pub const CMD_ATTRUP: i32 = 7;
pub const CMD_ATTRDN: i32 = 8;
pub const CMD_TOP: i32 = 9;
pub const CMD_BOT: i32 = 10;
pub const CMD_TOP_LEFT: i32 = 11;
pub const CMD_BOT_LEFT: i32 = 12;
pub const CMD_PRPGRPH: i32 = 13;
pub const CMD_NXPGRPH: i32 = 14;
pub const CMD_PRPROMPT: i32 = 15;
pub const CMD_NXPROMPT: i32 = 16;
pub const CMD_PRSEARCH: i32 = 17;
pub const CMD_NXSEARCH: i32 = 18;
pub const CMD_CHRLT: i32 = 19;
pub const CMD_CHRRT: i32 = 20;
pub const CMD_HWINLT: i32 = 21;
pub const CMD_HWINRT: i32 = 22;
pub const CMD_FWINLT: i32 = 23;
pub const CMD_FWINRT: i32 = 24;
pub const CMD_FWINLTSKIP: i32 = 25;
pub const CMD_FWINRTSKIP: i32 = 26;
pub const CMD_LNBEG: i32 = 27;
pub const CMD_LNEND: i32 = 28;
pub const CMD_HOME: i32 = 29;
pub const CMD_BACK: i32 = 30;
pub const CMD_RETURN: i32 = 31;
pub const CMD_FREEZE: i32 = 32;
pub const CMD_DISPMD: i32 = 33;
pub const CMD_SIXDOTS: i32 = 34;
pub const CMD_SLIDEWIN: i32 = 35;
pub const CMD_SKPIDLNS: i32 = 36;
pub const CMD_SKPBLNKWINS: i32 = 37;
pub const CMD_CSRVIS: i32 = 38;
pub const CMD_CSRTRK: i32 = 39;
pub const CMD_CSRSIZE: i32 = 40;
pub const CMD_CSRJMP_VERT: i32 = 41;
pub const CMD_ATTRVIS: i32 = 42;
pub const CMD_PASTE: i32 = 43;
pub const CMD_INFO: i32 = 44;
pub const CMD_HELP: i32 = 45;
pub const CMD_LEARN: i32 = 46;
pub const CMD_PREFMENU: i32 = 47;
pub const CMD_PREFSAVE: i32 = 48;
pub const CMD_PREFLOAD: i32 = 49;
pub const CMD_MENU_FIRST_ITEM: i32 = 50;
pub const CMD_MENU_LAST_ITEM: i32 = 51;
pub const CMD_MENU_PREV_ITEM: i32 = 52;
pub const CMD_MENU_NEXT_ITEM: i32 = 53;
pub const CMD_MENU_PREV_SETTING: i32 = 54;
pub const CMD_MENU_NEXT_SETTING: i32 = 55;
pub const CMD_MUTE: i32 = 56;
pub const CMD_SAY_LINE: i32 = 57;
pub const CMD_SAY_ABOVE: i32 = 58;
pub const CMD_SAY_BELOW: i32 = 59;
pub const CMD_SPKHOME: i32 = 60;
pub const CMD_AUTOSPEAK: i32 = 61;
pub const CMD_AUTOREPEAT: i32 = 62;
pub const CMD_RESTARTSPEECH: i32 = 63;
pub const CMD_SWITCHVT_PREV: i32 = 64;
pub const CMD_SWITCHVT_NEXT: i32 = 65;
pub const CMD_TUNES: i32 = 66;

/* Block commands: the argument in the low byte is a cell offset, a key
 * code, a dot combination, or a line number depending on the block. */
pub const BLK_ROUTE: i32 = 0x0100;
pub const BLK_CUTBEGIN: i32 = 0x0200;
pub const BLK_CUTAPPEND: i32 = 0x0300;
pub const BLK_CUTLINE: i32 = 0x0400;
pub const BLK_CUTRECT: i32 = 0x0500;
pub const BLK_SETMARK: i32 = 0x0600;
pub const BLK_GOTOMARK: i32 = 0x0700;
pub const BLK_SETLEFT: i32 = 0x0800;
pub const BLK_DESCCHAR: i32 = 0x0900;
pub const BLK_PRINDENT: i32 = 0x0A00;
pub const BLK_NXINDENT: i32 = 0x0B00;
pub const BLK_PRDIFCHAR: i32 = 0x0C00;
pub const BLK_NXDIFCHAR: i32 = 0x0D00;
pub const BLK_GOTOLINE: i32 = 0x0E00;
pub const BLK_SWITCHVT: i32 = 0x0F00;
pub const BLK_PASSKEY: i32 = 0x1000;
pub const BLK_PASSCHAR: i32 = 0x1100;
pub const BLK_PASSDOTS: i32 = 0x1200;
pub const BLK_PASSAT2: i32 = 0x1300;

/* Flags, orthogonal to command and block codes. */
pub const FLG_REPEAT_DELAY: i32 = 1 << 16;
pub const FLG_TOGGLE_ON: i32 = 1 << 17;
pub const FLG_TOGGLE_OFF: i32 = 1 << 18;
pub const FLG_LINE_SCALED: i32 = 1 << 19;
pub const FLG_LINE_TOLEFT: i32 = 1 << 20;
pub const FLG_CHAR_UPPER: i32 = 1 << 21;
pub const FLG_CHAR_CONTROL: i32 = 1 << 22;

/* Key codes passed as the argument of BLK_PASSKEY. */
pub const KEY_ENTER: i32 = 1;
pub const KEY_TAB: i32 = 2;
pub const KEY_BACKSPACE: i32 = 3;
pub const KEY_ESCAPE: i32 = 4;
pub const KEY_CURSOR_LEFT: i32 = 5;
pub const KEY_CURSOR_RIGHT: i32 = 6;
pub const KEY_CURSOR_UP: i32 = 7;
pub const KEY_CURSOR_DOWN: i32 = 8;
pub const KEY_PAGE_UP: i32 = 9;
pub const KEY_PAGE_DOWN: i32 = 10;
pub const KEY_HOME: i32 = 11;
pub const KEY_END: i32 = 12;
pub const KEY_INSERT: i32 = 13;
pub const KEY_DELETE: i32 = 14;
pub const KEY_FUNCTION: i32 = 15;

/* Dot bits passed as the argument of BLK_PASSDOTS (canonical order). */
pub const DOT1: i32 = 0x01;
pub const DOT2: i32 = 0x02;
pub const DOT3: i32 = 0x04;
pub const DOT4: i32 = 0x08;
pub const DOT5: i32 = 0x10;
pub const DOT6: i32 = 0x20;
pub const DOT7: i32 = 0x40;
pub const DOT8: i32 = 0x80;

/* Map a value in 0..=from_max onto 0..=to_max, rounding to nearest.
 * Used for scaled sensor-strip positions. */
pub fn rescale(value: i32, from_max: i32, to_max: i32) -> i32 {
    if from_max <= 0 {
        return 0;
    }
    (value * to_max + from_max / 2) / from_max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_and_arg_compose() {
        let command = BLK_ROUTE + 17;
        assert_eq!(command & MSK_BLK, BLK_ROUTE);
        assert_eq!(command & MSK_ARG, 17);
    }

    #[test]
    fn test_flags_do_not_overlap_command_space() {
        assert_eq!(FLG_REPEAT_DELAY & MSK_CMD, 0);
        assert_eq!(FLG_LINE_SCALED & MSK_CMD, 0);
    }

    #[test]
    fn test_rescale_endpoints() {
        assert_eq!(rescale(0, 26, 255), 0);
        assert_eq!(rescale(26, 26, 255), 255);
    }

    #[test]
    fn test_rescale_midpoint() {
        assert_eq!(rescale(13, 26, 255), 128);
    }
}
