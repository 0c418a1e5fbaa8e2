/* Braudi driver. */
/*  */
/* Line-oriented ASCII protocol at 9600 baud: frames end in CR, the     */
/* device sprinkles 0x06 acknowledgements into the stream, and key      */
/* frames are a category letter followed by a decimal number. */

use async_trait::async_trait;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::{Geometry, ProtocolDriver, read_byte};
use crate::cells::{DotsTable, OutputTable};
use crate::command::*;
use crate::error::{BrailleError, Result};
use crate::parameters::Parameters;
use crate::transport::{Port, SerialConfig, SerialParity};

const SERIAL_CONFIG: SerialConfig = SerialConfig::new(9600, SerialParity::None);

const DOTS_12374568: DotsTable = [0x01, 0x02, 0x04, 0x10, 0x20, 0x40, 0x08, 0x80];

const ACKNOWLEDGEMENT: u8 = 0x06;
const FRAME_END: u8 = b'\r';

pub struct BraudiDriver {
    output_table: OutputTable,
    cells: usize,
    output_buffer: Vec<u8>,
}

impl BraudiDriver {
    pub fn new() -> Self {
        Self {
            output_table: OutputTable::build(&DOTS_12374568),
            cells: 0,
            output_buffer: Vec::new(),
        }
    }

    /* Collect one CR-terminated frame, dropping stray acknowledgement
     * bytes before it starts. The CR is not part of the result. */
    async fn read_frame(&mut self, port: &mut Port) -> Result<Option<Vec<u8>>> {
        let mut frame: Vec<u8> = Vec::new();
        loop {
            let Some(byte) = read_byte(port, !frame.is_empty()).await? else {
                if !frame.is_empty() {
                    debug!("Partial frame: {:02x?}", frame);
                }
                return Ok(None);
            };
            if frame.is_empty() && byte == ACKNOWLEDGEMENT {
                continue;
            }
            if byte == FRAME_END {
                debug!("RX frame: {:02x?}", frame);
                return Ok(Some(frame));
            }
            frame.push(byte);
        }
    }

    async fn write_frame(&mut self, port: &mut Port, bytes: &[u8]) -> Result<()> {
        port.write_bytes(bytes).await?;
        port.credit_write_delay(bytes.len());
        Ok(())
    }

    async fn write_acknowledgement(&mut self, port: &mut Port) -> Result<()> {
        self.write_frame(port, &[ACKNOWLEDGEMENT]).await
    }

    async fn write_cells(&mut self, port: &mut Port) -> Result<()> {
        let mut frame = Vec::with_capacity(2 + self.cells);
        frame.push(b'D');
        for cell in &self.output_buffer {
            frame.push(self.output_table.translate(*cell));
        }
        frame.push(FRAME_END);
        self.write_frame(port, &frame).await
    }

    async fn identify_display(&mut self, port: &mut Port) -> Result<bool> {
        self.write_frame(port, b"I\r").await?;
        if !port.await_input(Duration::from_millis(1000)).await? {
            return Ok(false);
        }
        let Some(identity) = self.read_frame(port).await? else {
            return Ok(false);
        };

        if !identity.starts_with(b"braudi ") {
            warn!("Unrecognized identity: {:02x?}", identity);
            return Ok(false);
        }
        let Some(comma) = identity.iter().position(|byte| *byte == b',') else {
            warn!("Unrecognized identity: {:02x?}", identity);
            return Ok(false);
        };
        let cells: Option<usize> = std::str::from_utf8(&identity[comma + 1..])
            .ok()
            .map(str::trim)
            .and_then(|word| word.parse().ok());
        let Some(cells) = cells else {
            warn!("Unrecognized identity: {:02x?}", identity);
            return Ok(false);
        };

        info!("Detected: {}", String::from_utf8_lossy(&identity));
        self.cells = cells;
        Ok(true)
    }

    async fn set_table(&mut self, port: &mut Port, table: u8) -> Result<()> {
        let frame = format!("L{table}\r");
        self.write_frame(port, frame.as_bytes()).await
    }
}

#[async_trait]
impl ProtocolDriver for BraudiDriver {
    fn name(&self) -> &'static str {
        "Braudi"
    }

    async fn open(&mut self, port: &mut Port, _parameters: &Parameters) -> Result<Geometry> {
        port.configure_serial(&SERIAL_CONFIG).await?;
        if !self.identify_display(port).await? {
            return Err(BrailleError::ProbeFailed { driver: self.name() });
        }
        self.output_buffer = vec![0; self.cells];
        self.set_table(port, 0).await?;
        self.write_cells(port).await?;
        Ok(self.geometry())
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(self.cells, 0)
    }

    async fn write_window(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let count = self.cells.min(cells.len());
        if self.output_buffer[..count] != cells[..count] {
            self.output_buffer[..count].copy_from_slice(&cells[..count]);
            self.write_cells(port).await?;
        }
        Ok(())
    }

    async fn read_command(
        &mut self,
        port: &mut Port,
        _context: CommandContext,
    ) -> Result<ReadResult> {
        while let Some(frame) = self.read_frame(port).await? {
            let Some((category, digits)) = frame.split_first() else {
                continue;
            };
            let number: Option<u32> = std::str::from_utf8(digits)
                .ok()
                .and_then(|word| word.parse().ok());

            match category {
                b'F' => {
                    self.write_acknowledgement(port).await?;
                    let command = match number {
                        Some(1) => CMD_TOP_LEFT,
                        Some(2) => CMD_FWINLT,
                        Some(3) => CMD_LNDN,
                        Some(4) => CMD_LNUP,
                        Some(5) => CMD_FWINRT,
                        Some(6) => CMD_BOT_LEFT,
                        Some(23) => CMD_LNBEG,
                        Some(56) => CMD_LNEND,
                        Some(14) => CMD_CSRVIS,
                        Some(25) => CMD_DISPMD,
                        Some(26) => CMD_INFO,
                        Some(36) => CMD_HOME,
                        _ => {
                            warn!("Unexpected input: {:02x?}", frame);
                            continue;
                        }
                    };
                    return Ok(ReadResult::Command(command));
                }
                b'K' => {
                    self.write_acknowledgement(port).await?;
                    match number {
                        Some(key) if key >= 1 && key as usize <= self.cells => {
                            return Ok(ReadResult::Command(BLK_ROUTE + key as i32 - 1));
                        }
                        _ => {
                            warn!("Unexpected input: {:02x?}", frame);
                            continue;
                        }
                    }
                }
                _ => {
                    warn!("Unexpected input: {:02x?}", frame);
                    continue;
                }
            }
        }
        Ok(ReadResult::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_20() -> (BraudiDriver, Port) {
        let mut driver = BraudiDriver::new();
        let mut port = Port::mock();
        port.mock_mut().reply_on_write(b"I\r", b"braudi 1.0, 20\r");
        let geometry = driver
            .open(&mut port, &Parameters::empty())
            .await
            .unwrap();
        assert_eq!(geometry.text_columns, 20);
        port.mock_mut().take_output();
        (driver, port)
    }

    #[tokio::test]
    async fn test_open_parses_cell_count() {
        let (driver, _port) = open_20().await;
        assert_eq!(driver.cells, 20);
    }

    #[tokio::test]
    async fn test_write_only_on_change() {
        let (mut driver, mut port) = open_20().await;
        driver.write_window(&mut port, &[0u8; 20]).await.unwrap();
        assert!(port.mock_mut().take_output().is_empty());

        driver.write_window(&mut port, &[0x08u8; 20]).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(output[0], b'D');
        assert_eq!(*output.last().unwrap(), FRAME_END);
        /* Dot 4 moves to bit 4 in the device dot order. */
        assert_eq!(output[1], 0x10);
        assert_eq!(output.len(), 22);
    }

    #[tokio::test]
    async fn test_function_key_frame() {
        let (mut driver, mut port) = open_20().await;
        port.mock_mut().push_input(b"F4\r");
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_LNUP));
        /* Each key frame is acknowledged. */
        assert_eq!(port.mock_mut().take_output(), vec![ACKNOWLEDGEMENT]);
    }

    #[tokio::test]
    async fn test_routing_key_frame() {
        let (mut driver, mut port) = open_20().await;
        port.mock_mut().push_input(b"K7\r");
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_ROUTE + 6));
    }

    #[tokio::test]
    async fn test_leading_acknowledgements_skipped() {
        let (mut driver, mut port) = open_20().await;
        port.mock_mut().push_input(&[ACKNOWLEDGEMENT, ACKNOWLEDGEMENT]);
        port.mock_mut().push_input(b"K1\r");
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_ROUTE));
    }
}
