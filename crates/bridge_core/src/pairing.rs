use std::{io::Cursor, sync::Arc};

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use qrcode::{Color, EcLevel, QrCode};
use shared::domain::RoomId;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, error, warn, Instrument, Span};

use crate::{error::PairingError, Intent};

/// Room for one pairing code plus the cancellation sentinel.
pub(crate) const CODE_CHANNEL_CAPACITY: usize = 2;
pub(crate) const PAIRING_CANCELLED: &str = "error";

const QR_SIZE_PX: u32 = 256;
const QR_QUIET_ZONE: u32 = 4;

/// Renders `code` as a low error-correction QR PNG, 256px square unless the
/// code needs more modules than fit.
pub fn encode_qr_png(code: &str) -> Result<Vec<u8>, PairingError> {
    let qr = QrCode::with_error_correction_level(code.as_bytes(), EcLevel::L)
        .map_err(|err| PairingError::Encode(err.to_string()))?;
    let modules = qr.width() as u32;
    let colors = qr.to_colors();

    let total = modules + 2 * QR_QUIET_ZONE;
    let scale = (QR_SIZE_PX / total).max(1);
    let size = QR_SIZE_PX.max(total * scale);
    let offset = (size - modules * scale) / 2;

    let bitmap = GrayImage::from_fn(size, size, |x, y| {
        if x < offset || y < offset {
            return Luma([255]);
        }
        let (mx, my) = ((x - offset) / scale, (y - offset) / scale);
        if mx >= modules || my >= modules {
            return Luma([255]);
        }
        match colors[(my * modules + mx) as usize] {
            Color::Dark => Luma([0]),
            Color::Light => Luma([255]),
        }
    });

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(bitmap)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|err| PairingError::Encode(err.to_string()))?;
    Ok(png)
}

/// Waits for the first pairing code and posts it to `room` as a QR image.
///
/// Exits without uploading when it receives [`PAIRING_CANCELLED`] or when every
/// sender is gone.
pub(crate) fn spawn_qr_relay(
    bot: Arc<dyn Intent>,
    room: RoomId,
    mut codes: mpsc::Receiver<String>,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let Some(code) = codes.recv().await else {
                debug!(room_id = %room, "pairing: code channel closed before any code");
                return;
            };
            if code == PAIRING_CANCELLED {
                debug!(room_id = %room, "pairing: cancelled before a code was produced");
                return;
            }

            if let Err(err) = post_qr_code(bot.as_ref(), &room, &code).await {
                error!(room_id = %room, kind = %err.kind(), "pairing: {err}");
                if let Err(notice_err) = bot.send_notice(&room, err.notice()).await {
                    warn!(room_id = %room, "pairing: failed to report QR failure: {notice_err:#}");
                }
            }
        }
        .instrument(span),
    )
}

async fn post_qr_code(bot: &dyn Intent, room: &RoomId, code: &str) -> Result<(), PairingError> {
    let png = encode_qr_png(code)?;
    let uri = bot
        .upload_bytes(png, "image/png")
        .await
        .map_err(PairingError::Upload)?;
    bot.send_image(room, code, &uri)
        .await
        .map_err(PairingError::Send)?;
    debug!(room_id = %room, content_uri = %uri, "pairing: QR code posted");
    Ok(())
}

/// Releases a relay that may still be waiting for a code.
pub(crate) fn cancel_relay(codes: &mpsc::Sender<String>) {
    // The relay reads one value. A full buffer already holds that value and a
    // closed channel means the relay is gone, so neither case needs to block.
    match codes.try_send(PAIRING_CANCELLED.to_string()) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(_)) => {
            debug!("pairing: code buffer full, relay will exit on a queued code");
        }
    }
}

#[cfg(test)]
#[path = "tests/pairing_tests.rs"]
mod tests;
