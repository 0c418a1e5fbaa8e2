/* TechniBraille driver. */
/*  */
/* Frames are `00 function count payload checksum` with an XOR checksum, */
/* on an even-parity line. The same function-4 frame answers the probe   */
/* and acknowledges writes. The terminal has a one-line LCD shadow. */

use async_trait::async_trait;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::{Capabilities, Geometry, ProtocolDriver, read_byte};
use crate::cells::{DOTS_CANONICAL, OutputTable};
use crate::command::*;
use crate::error::{BrailleError, Result};
use crate::parameters::Parameters;
use crate::transport::{Port, SerialConfig, SerialParity};

const SERIAL_CONFIG: SerialConfig = SerialConfig::new(19200, SerialParity::Even);

/* Frame functions. */
const FN_WRITE_BRAILLE: u8 = 1;
const FN_WRITE_VISUAL: u8 = 2;
const FN_KEYS: u8 = 3;
const FN_DESCRIBE: u8 = 4;

pub struct TechniBrailleDriver {
    output_table: OutputTable,
    input_table: OutputTable,
    cells: usize,
    braille_cells: Vec<u8>,
    visual_cells: Vec<u8>,
}

impl TechniBrailleDriver {
    pub fn new() -> Self {
        let output_table = OutputTable::build(&DOTS_CANONICAL);
        let input_table = output_table.reversed();
        Self {
            output_table,
            input_table,
            cells: 0,
            braille_cells: Vec::new(),
            visual_cells: Vec::new(),
        }
    }

    async fn write_frame(
        &mut self,
        port: &mut Port,
        function: u8,
        data: &[u8],
    ) -> Result<()> {
        let mut frame = Vec::with_capacity(data.len() + 4);
        frame.push(0);
        frame.push(function);
        frame.push(data.len() as u8);
        frame.extend_from_slice(data);
        let checksum = frame.iter().fold(0u8, |checksum, byte| checksum ^ byte);
        frame.push(checksum);

        port.write_bytes(&frame).await?;
        port.credit_write_delay(data.len());
        Ok(())
    }

    /* Inbound frames are three bytes: a zero, the function, one value. */
    async fn read_frame(&mut self, port: &mut Port) -> Result<Option<[u8; 3]>> {
        let mut frame = [0u8; 3];
        let mut offset = 0;
        loop {
            let Some(byte) = read_byte(port, offset > 0).await? else {
                if offset > 0 {
                    debug!("Aborted Input: {:02x?}", &frame[..offset]);
                }
                return Ok(None);
            };
            if offset == 0 && byte != 0 {
                debug!("Discarded Input: {byte:02x}");
                continue;
            }
            frame[offset] = byte;
            offset += 1;
            if offset == frame.len() {
                return Ok(Some(frame));
            }
        }
    }

    async fn write_braille_cells(&mut self, port: &mut Port) -> Result<()> {
        let cells = self.braille_cells.clone();
        self.write_frame(port, FN_WRITE_BRAILLE, &cells).await
    }

    async fn write_visual_cells(&mut self, port: &mut Port) -> Result<()> {
        let cells = self.visual_cells.clone();
        self.write_frame(port, FN_WRITE_VISUAL, &cells).await
    }
}

#[async_trait]
impl ProtocolDriver for TechniBrailleDriver {
    fn name(&self) -> &'static str {
        "TechniBraille"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            visual_display: true,
            ..Capabilities::default()
        }
    }

    async fn open(&mut self, port: &mut Port, _parameters: &Parameters) -> Result<Geometry> {
        port.configure_serial(&SERIAL_CONFIG).await?;

        self.write_frame(port, FN_DESCRIBE, &[]).await?;
        while port.await_input(Duration::from_millis(500)).await? {
            let Some(frame) = self.read_frame(port).await? else {
                break;
            };
            if frame[1] == FN_DESCRIBE {
                self.cells = usize::from(frame[2]);
                self.braille_cells = vec![0; self.cells];
                self.visual_cells = vec![b' '; self.cells];

                self.write_braille_cells(port).await?;
                self.write_visual_cells(port).await?;
                return Ok(self.geometry());
            }
        }
        Err(BrailleError::ProbeFailed { driver: self.name() })
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(self.cells, 0)
    }

    async fn write_window(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let count = self.cells.min(cells.len());
        let mut translated = vec![0u8; count];
        self.output_table.translate_slice(&cells[..count], &mut translated);
        if self.braille_cells[..count] != translated[..] {
            self.braille_cells[..count].copy_from_slice(&translated);
            self.write_braille_cells(port).await?;
        }
        Ok(())
    }

    async fn write_visual(&mut self, port: &mut Port, text: &[u8]) -> Result<()> {
        let count = self.cells.min(text.len());
        if self.visual_cells[..count] != text[..count] {
            self.visual_cells[..count].copy_from_slice(&text[..count]);
            self.write_visual_cells(port).await?;
        }
        Ok(())
    }

    async fn read_command(
        &mut self,
        port: &mut Port,
        _context: CommandContext,
    ) -> Result<ReadResult> {
        while let Some(frame) = self.read_frame(port).await? {
            let command = match frame[1] {
                FN_WRITE_BRAILLE => {
                    /* Braille keyboard: dots arrive in device order. */
                    BLK_PASSDOTS | i32::from(self.input_table.translate(frame[2]))
                }

                FN_WRITE_VISUAL => {
                    let column = usize::from(frame[2]);
                    if column == 0 || column > self.cells {
                        continue;
                    }
                    BLK_ROUTE + column as i32 - 1
                }

                FN_KEYS => match frame[2] {
                    /* left rear: two columns, one row */
                    0x02 => CMD_LEARN,   /* ESC */
                    0x01 => CMD_PREFMENU, /* M */

                    /* left middle: cross */
                    0x06 => CMD_LNUP,
                    0x03 => CMD_FWINLT,
                    0x05 => CMD_FWINRT,
                    0x04 => CMD_LNDN,

                    /* left front: two columns, three rows */
                    0x09 => CMD_RETURN, /* ins */
                    0x0A => CMD_TOP,    /* E */
                    0x0B => CMD_CSRTRK, /* supp */
                    0x0C => CMD_BOT,    /* L */
                    0x07 => CMD_CHRLT,  /* extra 1 (40s only) */
                    0x08 => CMD_CHRRT,  /* extra 2 (40s only) */

                    0x0E => BLK_PASSKEY + KEY_BACKSPACE, /* left thumb */
                    0x0F => BLK_PASSDOTS,                /* right thumb */
                    0x3F => BLK_PASSKEY + KEY_ENTER,     /* both thumbs */

                    0x29 => BLK_PASSKEY + KEY_ESCAPE, /* key under dot 7 */
                    0x2A => BLK_PASSKEY + KEY_TAB,    /* key under dot 8 */

                    /* right rear and middle (40s only) */
                    0x19 => CMD_INFO,
                    0x1B => CMD_PRDIFLN,
                    0x1A => CMD_NXDIFLN,

                    /* right front: one column, four rows (40s only) */
                    0x2B => CMD_FREEZE,  /* slash */
                    0x2C => CMD_DISPMD,  /* asterisk */
                    0x2D => CMD_ATTRVIS, /* minus */
                    0x2E => CMD_CSRVIS,  /* plus */

                    /* numeric pad (40s only) */
                    0x37 => BLK_PASSKEY + KEY_HOME,
                    0x38 => BLK_PASSKEY + KEY_CURSOR_UP,
                    0x39 => BLK_PASSKEY + KEY_PAGE_UP,
                    0x34 => BLK_PASSKEY + KEY_CURSOR_LEFT,
                    0x35 => CMD_CSRJMP_VERT,
                    0x36 => BLK_PASSKEY + KEY_CURSOR_RIGHT,
                    0x31 => BLK_PASSKEY + KEY_END,
                    0x32 => BLK_PASSKEY + KEY_CURSOR_DOWN,
                    0x33 => BLK_PASSKEY + KEY_PAGE_DOWN,
                    0x28 => CMD_SIXDOTS, /* verr num */
                    0x30 => BLK_PASSKEY + KEY_INSERT,
                    0x2F => BLK_PASSKEY + KEY_DELETE,

                    _ => {
                        warn!("Unhandled Input: {:02x?}", frame);
                        continue;
                    }
                },

                /* Write acknowledgement: 00 04 nn, nn bytes accepted. */
                FN_DESCRIBE => continue,

                _ => {
                    warn!("Unhandled Input: {:02x?}", frame);
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

    fn checksum(frame: &[u8]) -> u8 {
        frame.iter().fold(0u8, |checksum, byte| checksum ^ byte)
    }

    async fn open_40() -> (TechniBrailleDriver, Port) {
        let mut driver = TechniBrailleDriver::new();
        let mut port = Port::mock();
        port.mock_mut().reply_on_write(&[0, FN_DESCRIBE, 0], &[0, FN_DESCRIBE, 40]);
        let geometry = driver
            .open(&mut port, &Parameters::empty())
            .await
            .unwrap();
        assert_eq!(geometry.text_columns, 40);
        port.mock_mut().take_output();
        (driver, port)
    }

    #[tokio::test]
    async fn test_open_clears_both_planes() {
        let mut driver = TechniBrailleDriver::new();
        let mut port = Port::mock();
        port.mock_mut().reply_on_write(&[0, FN_DESCRIBE, 0], &[0, FN_DESCRIBE, 40]);
        driver.open(&mut port, &Parameters::empty()).await.unwrap();

        let output = port.mock_mut().take_output();
        /* probe frame, then 44-byte braille and visual clear frames */
        assert_eq!(output.len(), 4 + 44 * 2);
        assert_eq!(output[4..7], [0, FN_WRITE_BRAILLE, 40]);
        assert_eq!(output[48..51], [0, FN_WRITE_VISUAL, 40]);
    }

    #[tokio::test]
    async fn test_frame_checksum() {
        let (mut driver, mut port) = open_40().await;
        let mut cells = [0u8; 40];
        cells[0] = 0xFF;
        driver.write_window(&mut port, &cells).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(checksum(&output), 0);

        /* A single flipped payload byte breaks the checksum. */
        let mut mutated = output.clone();
        mutated[5] ^= 0x20;
        assert_ne!(checksum(&mutated), 0);
    }

    #[tokio::test]
    async fn test_unchanged_window_writes_nothing() {
        let (mut driver, mut port) = open_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        assert!(port.mock_mut().take_output().is_empty());
    }

    #[tokio::test]
    async fn test_dot_keys_pass_through_input_table() {
        let (mut driver, mut port) = open_40().await;
        port.mock_mut().push_input(&[0, FN_WRITE_BRAILLE, 0x09]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_PASSDOTS | 0x09));
    }

    #[tokio::test]
    async fn test_routing_frame() {
        let (mut driver, mut port) = open_40().await;
        port.mock_mut().push_input(&[0, FN_WRITE_VISUAL, 12]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_ROUTE + 11));
    }

    #[tokio::test]
    async fn test_write_acknowledgement_consumed() {
        let (mut driver, mut port) = open_40().await;
        port.mock_mut().push_input(&[0, FN_DESCRIBE, 40]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::None);
    }

    #[tokio::test]
    async fn test_visual_cells_write() {
        let (mut driver, mut port) = open_40().await;
        let mut text = [b' '; 40];
        text[..5].copy_from_slice(b"hello");
        driver.write_visual(&mut port, &text).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(&output[..3], &[0, FN_WRITE_VISUAL, 40]);
        assert_eq!(&output[3..8], b"hello");
    }
}
