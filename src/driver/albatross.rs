/* Tivomatic Albatross driver. */
/*  */
/* The display announces itself with 0xFF and a description byte, at     */
/* either 19200 or 9600 baud. Updates are (position, cell) pairs inside  */
/* a 0xFB .. 0xFC frame; the device garbles silently, so a full refresh  */
/* goes out whenever a second has passed since the last frame. */

use async_trait::async_trait;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Geometry, ProtocolDriver, read_byte};
use crate::cells::{DotsTable, OutputTable};
use crate::command::*;
use crate::error::{BrailleError, Result};
use crate::parameters::Parameters;
use crate::transport::{Port, SerialConfig, SerialParity};

/* Dots are wired in reverse order on this hardware. */
const DOTS_87654321: DotsTable = [0x80, 0x40, 0x20, 0x10, 0x08, 0x04, 0x02, 0x01];

const BAUD_TABLE: [u32; 2] = [19200, 9600];

const FRAME_START: u8 = 0xFB;
const FRAME_END: u8 = 0xFC;
const CLEAR_DISPLAY: u8 = 0xFA;
const IDENTITY: u8 = 0xFF;

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

const LOWER_ROUTING_DEFAULT: i32 = BLK_ROUTE;
const UPPER_ROUTING_DEFAULT: i32 = BLK_DESCCHAR;

/* Key codes of the two top keypads, used for the description byte's
 * keypad remapping. */
const TOP_LEFT_KEYS: [u8; 8] = [84, 83, 87, 85, 86, 88, 89, 90];
const TOP_RIGHT_KEYS: [u8; 8] = [194, 193, 198, 195, 196, 197, 199, 200];

pub struct AlbatrossDriver {
    output_table: OutputTable,
    input_map: [u8; 0x100],

    display_content: Vec<u8>,
    display_size: usize,
    window_width: usize,
    window_start: usize,
    status_count: usize,
    status_start: usize,

    lower_routing: i32,
    upper_routing: i32,

    last_update: Instant,
    resize_required: bool,
}

impl AlbatrossDriver {
    pub fn new() -> Self {
        let mut input_map = [0u8; 0x100];
        for (index, entry) in input_map.iter_mut().enumerate() {
            *entry = index as u8;
        }
        Self {
            output_table: OutputTable::build(&DOTS_87654321),
            input_map,
            display_content: Vec::new(),
            display_size: 0,
            window_width: 0,
            window_start: 0,
            status_count: 0,
            status_start: 0,
            lower_routing: LOWER_ROUTING_DEFAULT,
            upper_routing: UPPER_ROUTING_DEFAULT,
            last_update: Instant::now(),
            resize_required: false,
        }
    }

    async fn await_byte(&mut self, port: &mut Port) -> Result<Option<u8>> {
        if let Some(byte) = read_byte(port, false).await? {
            return Ok(Some(byte));
        }
        if port.await_input(Duration::from_millis(1000)).await? {
            return read_byte(port, false).await;
        }
        Ok(None)
    }

    /* Answer the identity burst: confirm the description byte, send the
     * acknowledgement, and derive the geometry and key mapping. */
    async fn acknowledge_display(&mut self, port: &mut Port) -> Result<bool> {
        let Some(description) = self.await_byte(port).await? else {
            return Ok(false);
        };
        if description == IDENTITY {
            return Ok(false);
        }
        if self.await_byte(port).await? != Some(IDENTITY) {
            return Ok(false);
        }
        if self.await_byte(port).await? != Some(description) {
            return Ok(false);
        }

        port.write_bytes(&[0xFE, 0xFF, 0xFE, 0xFF]).await?;
        port.credit_write_delay(4);
        port.discard_input().await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        port.discard_input().await?;
        debug!("Albatross description byte: {description:02X}");

        self.window_start = 0;
        self.status_start = 0;
        self.display_size = if description & 0x80 != 0 { 80 } else { 46 };
        self.status_count = usize::from(description & 0x0F);
        if self.status_count != 0 {
            self.window_width = self.display_size - self.status_count - 1;
            if description & 0x20 != 0 {
                self.status_start = self.window_width + 1;
            } else {
                self.window_start = self.status_count + 1;
            }
        } else {
            self.window_width = self.display_size;
        }
        self.display_content = vec![0; self.display_size];

        /* Top keypad remapping. */
        for (index, entry) in self.input_map.iter_mut().enumerate() {
            *entry = index as u8;
        }
        let (left, right) = match description & 0x50 {
            0x00 => (None, None),                                   /* left right */
            0x10 => (Some(TOP_RIGHT_KEYS), None),                   /* right right */
            0x50 => (None, Some(TOP_LEFT_KEYS)),                    /* left left */
            0x40 => (Some(TOP_RIGHT_KEYS), Some(TOP_LEFT_KEYS)),    /* right left */
            _ => (None, None),
        };
        if let Some(left) = left {
            for (index, key) in TOP_LEFT_KEYS.iter().enumerate() {
                self.input_map[usize::from(*key)] = left[index];
            }
        }
        if let Some(right) = right {
            for (index, key) in TOP_RIGHT_KEYS.iter().enumerate() {
                self.input_map[usize::from(*key)] = right[index];
            }
        }

        self.lower_routing = LOWER_ROUTING_DEFAULT;
        self.upper_routing = UPPER_ROUTING_DEFAULT;

        info!(
            "Albatross: {} cells ({} text, {} status), status {}.",
            self.display_size,
            self.window_width,
            self.status_count,
            if self.status_count == 0 {
                "absent"
            } else if self.status_start != 0 {
                "right"
            } else {
                "left"
            }
        );
        Ok(true)
    }

    async fn clear_display(&mut self, port: &mut Port) -> Result<()> {
        port.write_bytes(&[CLEAR_DISPLAY]).await?;
        port.credit_write_delay(1);
        self.display_content.fill(0);
        Ok(())
    }

    /* Emit the pair frame. With cells, only changed positions go out;
     * without, the whole remembered content is re-sent. */
    async fn update_display(
        &mut self,
        port: &mut Port,
        cells: Option<&[u8]>,
        count: usize,
        start: usize,
    ) -> Result<()> {
        let mut frame = vec![FRAME_START];
        for index in 0..count {
            let position = start + index;
            let cell = match cells {
                None => self.display_content[position],
                Some(cells) => {
                    let cell = self.output_table.translate(cells[index]);
                    if cell == self.display_content[position] {
                        continue;
                    }
                    self.display_content[position] = cell;
                    cell
                }
            };
            frame.push((position + 1) as u8);
            frame.push(cell);
        }

        if frame.len() > 1 || self.last_update.elapsed() >= REFRESH_INTERVAL {
            frame.push(FRAME_END);
            port.write_bytes(&frame).await?;
            port.credit_write_delay(frame.len());
            self.last_update = Instant::now();
        }
        Ok(())
    }

    async fn refresh_display(&mut self, port: &mut Port) -> Result<()> {
        let size = self.display_size;
        self.update_display(port, None, size, 0).await
    }

    /* The four routing ranges: lower and upper row, each with a direct
     * and a shifted block of codes. */
    fn routing_command(&self, byte: u8, lower: i32, upper: i32) -> Option<i32> {
        let byte = i32::from(byte);
        let (base, offset) = match byte {
            2..=41 => (lower, byte - 2),
            111..=150 => (lower, byte - 71),
            43..=82 => (upper, byte - 43),
            152..=191 => (upper, byte - 112),
            _ => return None,
        };
        let offset = offset as usize;
        if offset >= self.window_start && offset < self.window_start + self.window_width {
            Some(base + (offset - self.window_start) as i32)
        } else {
            None
        }
    }
}

#[async_trait]
impl ProtocolDriver for AlbatrossDriver {
    fn name(&self) -> &'static str {
        "Albatross"
    }

    async fn open(&mut self, port: &mut Port, _parameters: &Parameters) -> Result<Geometry> {
        for baud in BAUD_TABLE.iter().cycle().take(BAUD_TABLE.len() * 2) {
            port.configure_serial(&SerialConfig::new(*baud, SerialParity::None))
                .await?;
            debug!("Trying Albatross at {baud} baud.");

            let start = Instant::now();
            let mut count = 0;
            while let Some(byte) = self.await_byte(port).await? {
                if byte == IDENTITY {
                    if !self.acknowledge_display(port).await? {
                        break;
                    }
                    self.clear_display(port).await?;
                    self.resize_required = false;
                    return Ok(self.geometry());
                }
                count += 1;
                if count == 100 {
                    break;
                }
                if start.elapsed() > Duration::from_secs(5) {
                    break;
                }
            }
        }
        Err(BrailleError::ProbeFailed { driver: self.name() })
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(self.window_width, self.status_count)
    }

    fn take_resize_required(&mut self) -> bool {
        std::mem::take(&mut self.resize_required)
    }

    async fn write_window(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let count = self.window_width.min(cells.len());
        let start = self.window_start;
        self.update_display(port, Some(&cells[..count]), count, start).await
    }

    async fn write_status(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let count = self.status_count.min(cells.len());
        let start = self.status_start;
        self.update_display(port, Some(&cells[..count]), count, start).await
    }

    async fn read_command(
        &mut self,
        port: &mut Port,
        _context: CommandContext,
    ) -> Result<ReadResult> {
        while let Some(byte) = read_byte(port, false).await? {
            if byte == IDENTITY {
                /* Power cycle: the display re-announces itself. */
                if self.acknowledge_display(port).await? {
                    self.refresh_display(port).await?;
                    self.resize_required = true;
                }
                continue;
            }

            let byte = self.input_map[usize::from(byte)];

            let lower = self.lower_routing;
            let upper = self.upper_routing;
            self.lower_routing = LOWER_ROUTING_DEFAULT;
            self.upper_routing = UPPER_ROUTING_DEFAULT;

            if let Some(command) = self.routing_command(byte, lower, upper) {
                return Ok(ReadResult::Command(command));
            }

            let command = match byte {
                FRAME_START => {
                    self.refresh_display(port).await?;
                    continue;
                }

                83 => CMD_LEARN,           /* key: top left first lower */
                84 => CMD_HELP,            /* key: top left first upper */
                85 => CMD_PASTE,           /* key: top left third upper */
                86 => CMD_CSRTRK,          /* key: top left third lower */
                87 => {
                    /* key: top left second */
                    self.lower_routing = BLK_CUTBEGIN;
                    self.upper_routing = BLK_SETMARK;
                    CMD_NOOP
                }
                88 => {
                    /* key: top left fourth */
                    self.lower_routing = BLK_CUTAPPEND;
                    self.upper_routing = BLK_GOTOMARK;
                    CMD_NOOP
                }
                89 => CMD_PREFMENU,        /* key: top left fifth upper */
                90 => CMD_INFO,            /* key: top left fifth lower */

                193 => CMD_NXPROMPT,       /* key: top right first lower */
                194 => CMD_PRPROMPT,       /* key: top right first upper */
                195 => CMD_PRDIFLN,        /* key: top right third upper */
                196 => CMD_NXDIFLN,        /* key: top right third lower */
                198 => {
                    /* key: top right second */
                    self.lower_routing = BLK_CUTRECT;
                    self.upper_routing = BLK_NXINDENT;
                    CMD_NOOP
                }
                197 => {
                    /* key: top right fourth */
                    self.lower_routing = BLK_CUTLINE;
                    self.upper_routing = BLK_PRINDENT;
                    CMD_NOOP
                }
                199 => CMD_PRPGRPH,        /* key: top right fifth upper */
                200 => CMD_NXPGRPH,        /* key: top right fifth lower */

                91 | 201 => CMD_TOP_LEFT,  /* keys: front first upper */
                92 | 202 => CMD_BOT_LEFT,  /* keys: front first lower */
                93 | 203 => CMD_BACK,      /* keys: front second upper */
                94 | 204 => CMD_HOME,      /* keys: front second lower */
                95 | 205 | 98 => CMD_LNUP, /* keys: front third upper */
                96 | 206 | 208 => CMD_LNDN, /* keys: front third lower */
                97 => CMD_FWINLT,          /* key: front left fourth */
                207 => CMD_FWINRT,         /* key: front right fourth */

                103 | 213 => CMD_CHRRT,    /* wheels: front right */
                104 | 214 => CMD_CHRLT,    /* wheels: front left */
                105 | 215 => CMD_LNUP,     /* wheels: side backward */
                106 | 216 => CMD_LNDN,     /* wheels: side forward */

                42 => CMD_FREEZE,          /* key: attribute left upper */
                1 => CMD_DISPMD,           /* key: attribute left lower */
                192 => CMD_ATTRUP,         /* key: attribute right upper */
                151 => CMD_ATTRDN,         /* key: attribute right lower */

                _ => {
                    warn!("Unexpected byte: {byte:02X}");
                    continue;
                }
            };
            return Ok(ReadResult::Command(command));
        }
        Ok(ReadResult::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_80(description: u8) -> (AlbatrossDriver, Port) {
        let mut driver = AlbatrossDriver::new();
        let mut port = Port::mock();
        port.mock_mut()
            .push_input(&[IDENTITY, description, IDENTITY, description]);
        let geometry = driver
            .open(&mut port, &Parameters::empty())
            .await
            .unwrap();
        assert_eq!(geometry.text_columns + geometry.status_columns, usize::from(description & 0x0F) + 80);
        port.mock_mut().take_output();
        (driver, port)
    }

    #[tokio::test]
    async fn test_open_geometry_no_status() {
        let (driver, _port) = open_80(0x80).await;
        assert_eq!(driver.display_size, 80);
        assert_eq!(driver.window_width, 80);
        assert_eq!(driver.status_count, 0);
    }

    #[tokio::test]
    async fn test_no_change_no_frame() {
        let (mut driver, mut port) = open_80(0x80).await;
        driver.write_window(&mut port, &[0u8; 80]).await.unwrap();
        assert!(port.mock_mut().take_output().is_empty());
    }

    #[tokio::test]
    async fn test_single_cell_pair_frame() {
        let (mut driver, mut port) = open_80(0x80).await;
        let mut cells = [0u8; 80];
        cells[20] = 0xFF;
        driver.write_window(&mut port, &cells).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(output, vec![FRAME_START, 21, 0xFF, FRAME_END]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_after_one_second() {
        let (mut driver, mut port) = open_80(0x80).await;
        driver.write_window(&mut port, &[0u8; 80]).await.unwrap();
        assert!(port.mock_mut().take_output().is_empty());

        tokio::time::advance(Duration::from_millis(1100)).await;
        driver.write_window(&mut port, &[0u8; 80]).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(output, vec![FRAME_START, FRAME_END]);
    }

    #[tokio::test]
    async fn test_routing_key_lower_row() {
        let (mut driver, mut port) = open_80(0x80).await;
        port.mock_mut().push_input(&[2 + 5]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_ROUTE + 5));
    }

    #[tokio::test]
    async fn test_deferred_routing_function() {
        let (mut driver, mut port) = open_80(0x80).await;

        /* Top-left second arms cut-begin on the lower routing row. */
        port.mock_mut().push_input(&[87]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_NOOP));

        port.mock_mut().push_input(&[2 + 7]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_CUTBEGIN + 7));

        /* The function resets to plain routing afterwards. */
        port.mock_mut().push_input(&[2 + 7]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_ROUTE + 7));
    }

    #[tokio::test]
    async fn test_reannounce_sets_resize_and_refreshes() {
        let (mut driver, mut port) = open_80(0x80).await;
        port.mock_mut()
            .push_input(&[IDENTITY, 0x80, IDENTITY, 0x80]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::None);
        assert!(driver.take_resize_required());

        /* The refresh frame re-sends every cell. */
        let output = port.mock_mut().take_output();
        let frame_start = output
            .iter()
            .position(|byte| *byte == FRAME_START)
            .unwrap();
        let frame = &output[frame_start..];
        assert_eq!(frame.len(), 2 + 80 * 2);
    }

    #[tokio::test]
    async fn test_key_map_front_keys() {
        let (mut driver, mut port) = open_80(0x80).await;
        port.mock_mut().push_input(&[97, 207]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_FWINLT));
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_FWINRT));
    }
}
