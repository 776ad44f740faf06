// =============================================================================
// MinimalOS NextGen — Framebuffer Text Output
// =============================================================================
//
// Minimal character-cell renderer over the Limine-provided linear
// framebuffer. Used by the write() syscall to render STDOUT/STDERR for
// processes that have no terminal (§4.6): each byte written advances the
// calling process's own cursor (cursor_x, cursor_y), not a single shared
// cursor, so concurrent writers don't interleave glyph writes.
//
// Glyphs are simple solid/outline blocks rather than a full bitmap font —
// legible enough to show output is flowing without carrying a font table.
// =============================================================================

use spin::Once;

use crate::arch::boot::FramebufferInfo;

const CELL_W: u32 = 8;
const CELL_H: u32 = 16;

static FB: Once<FramebufferInfo> = Once::new();

pub fn init(info: FramebufferInfo) {
    FB.call_once(|| info);
}

fn fb() -> Option<&'static FramebufferInfo> {
    FB.get()
}

pub fn cols() -> u32 {
    fb().map(|f| f.width / CELL_W).unwrap_or(0)
}

pub fn rows() -> u32 {
    fb().map(|f| f.height / CELL_H).unwrap_or(0)
}

#[inline]
unsafe fn put_pixel(info: &FramebufferInfo, x: u32, y: u32, rgb: u32) {
    if x >= info.width || y >= info.height {
        return;
    }
    let offset = y as usize * info.pitch as usize + x as usize * (info.bpp as usize / 8);
    unsafe {
        let ptr = info.address.add(offset) as *mut u32;
        ptr.write_volatile(rgb);
    }
}

/// Draws one character cell at column/row `(cx, cy)`. Printable characters
/// get a light outline box; space clears the cell.
fn draw_cell(info: &FramebufferInfo, cx: u32, cy: u32, byte: u8) {
    let x0 = cx * CELL_W;
    let y0 = cy * CELL_H;
    let fg: u32 = 0x00D0_D0D0;
    let bg: u32 = 0x0010_1010;

    for row in 0..CELL_H {
        for col in 0..CELL_W {
            let on = byte != b' '
                && byte != 0
                && (row == 0 || row == CELL_H - 1 || col == 0 || col == CELL_W - 1);
            let color = if on { fg } else { bg };
            unsafe { put_pixel(info, x0 + col, y0 + row, color) };
        }
    }
}

fn scroll(info: &FramebufferInfo) {
    let row_bytes = info.pitch as usize * CELL_H as usize;
    let total_rows = rows();
    if total_rows == 0 {
        return;
    }
    unsafe {
        let base = info.address;
        let visible_bytes = info.pitch as usize * info.height as usize;
        core::ptr::copy(base.add(row_bytes), base, visible_bytes - row_bytes);
        core::ptr::write_bytes(base.add(visible_bytes - row_bytes), 0, row_bytes);
    }
}

/// Writes `bytes` at the process cursor `(cursor_x, cursor_y)`, wrapping at
/// the right edge and scrolling at the bottom. Returns the updated cursor.
pub fn write_at(cursor_x: &mut u32, cursor_y: &mut u32, bytes: &[u8]) {
    let Some(info) = fb() else { return };
    let cols = cols().max(1);
    let rows = rows().max(1);

    for &b in bytes {
        if b == b'\n' {
            *cursor_x = 0;
            *cursor_y += 1;
        } else {
            draw_cell(info, *cursor_x, *cursor_y, b);
            *cursor_x += 1;
            if *cursor_x >= cols {
                *cursor_x = 0;
                *cursor_y += 1;
            }
        }
        if *cursor_y >= rows {
            scroll(info);
            *cursor_y = rows - 1;
        }
    }
}
