//! In-memory AVI writer for tests.

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn chunk(out: &mut Vec<u8>, tag: &[u8; 4], body: &[u8]) {
    out.extend_from_slice(tag);
    put_u32(out, body.len() as u32);
    out.extend_from_slice(body);
    if body.len() % 2 == 1 {
        out.push(0);
    }
}

fn list(out: &mut Vec<u8>, list_type: &[u8; 4], body: &[u8]) {
    out.extend_from_slice(b"LIST");
    put_u32(out, body.len() as u32 + 4);
    out.extend_from_slice(list_type);
    out.extend_from_slice(body);
}

enum MoviEntry {
    Chunk([u8; 4], Vec<u8>),
    Rec(Vec<([u8; 4], Vec<u8>)>),
}

pub(crate) struct AviBuilder {
    width: u32,
    height: u32,
    fps: u32,
    rate: u32,
    scale: u32,
    codec: [u8; 4],
    audio: Option<(u32, u16)>,
    movi: Option<Vec<MoviEntry>>,
}

/// Payload bytes are `seed, seed+1, ...` so tests can tell chunks apart.
fn payload(seed: usize, size: usize) -> Vec<u8> {
    (0..size).map(|i| (seed + i) as u8).collect()
}

impl AviBuilder {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            rate: fps,
            scale: 1,
            codec: *b"MJPG",
            audio: None,
            movi: Some(Vec::new()),
        }
    }

    pub fn with_pcm_audio(mut self, sample_rate: u32, channels: u16) -> Self {
        self.audio = Some((sample_rate, channels));
        self
    }

    pub fn video_codec(mut self, fourcc: [u8; 4]) -> Self {
        self.codec = fourcc;
        self
    }

    pub fn stream_rate(mut self, rate: u32, scale: u32) -> Self {
        self.rate = rate;
        self.scale = scale;
        self
    }

    pub fn without_movi(mut self) -> Self {
        self.movi = None;
        self
    }

    fn entries(&mut self) -> &mut Vec<MoviEntry> {
        self.movi.get_or_insert_with(Vec::new)
    }

    pub fn chunk_with(mut self, tag: [u8; 4], data: Vec<u8>) -> Self {
        self.entries().push(MoviEntry::Chunk(tag, data));
        self
    }

    pub fn chunk(mut self, tag: [u8; 4], size: usize) -> Self {
        let seed = self.entries().len();
        self.chunk_with(tag, payload(seed, size))
    }

    pub fn video(self, size: usize) -> Self {
        self.chunk(*b"00dc", size)
    }

    pub fn audio(self, size: usize) -> Self {
        self.chunk(*b"01wb", size)
    }

    pub fn rec_list(mut self, chunks: &[([u8; 4], usize)]) -> Self {
        let seed = self.entries().len();
        let rec = chunks
            .iter()
            .enumerate()
            .map(|(i, (tag, size))| (*tag, payload(seed + i, *size)))
            .collect();
        self.entries().push(MoviEntry::Rec(rec));
        self
    }

    fn strh(&self, fcc_type: &[u8; 4], handler: &[u8; 4], scale: u32, rate: u32) -> Vec<u8> {
        let mut strh = Vec::with_capacity(56);
        strh.extend_from_slice(fcc_type);
        strh.extend_from_slice(handler);
        put_u32(&mut strh, 0); // flags
        put_u16(&mut strh, 0); // priority
        put_u16(&mut strh, 0); // language
        put_u32(&mut strh, 0); // initial frames
        put_u32(&mut strh, scale);
        put_u32(&mut strh, rate);
        put_u32(&mut strh, 0); // start
        put_u32(&mut strh, 0); // length
        put_u32(&mut strh, 0); // suggested buffer
        put_u32(&mut strh, 0); // quality
        put_u32(&mut strh, 0); // sample size
        strh.extend_from_slice(&[0u8; 8]); // rcFrame
        strh
    }

    pub fn build(self) -> Vec<u8> {
        let video_frames = self
            .movi
            .iter()
            .flatten()
            .map(|e| match e {
                MoviEntry::Chunk(tag, _) => usize::from(&tag[2..4] == b"dc"),
                MoviEntry::Rec(chunks) => chunks.iter().filter(|(t, _)| &t[2..4] == b"dc").count(),
            })
            .sum::<usize>() as u32;

        let mut avih = Vec::with_capacity(56);
        let us_per_frame = if self.fps > 0 { 1_000_000 / self.fps } else { 0 };
        put_u32(&mut avih, us_per_frame);
        put_u32(&mut avih, 0); // max bytes/sec
        put_u32(&mut avih, 0); // padding granularity
        put_u32(&mut avih, 0x10); // flags: has index
        put_u32(&mut avih, video_frames);
        put_u32(&mut avih, 0); // initial frames
        put_u32(&mut avih, if self.audio.is_some() { 2 } else { 1 });
        put_u32(&mut avih, 0); // suggested buffer
        put_u32(&mut avih, self.width);
        put_u32(&mut avih, self.height);
        avih.extend_from_slice(&[0u8; 16]);

        let mut hdrl = Vec::new();
        chunk(&mut hdrl, b"avih", &avih);

        let mut vstrl = Vec::new();
        chunk(&mut vstrl, b"strh", &self.strh(b"vids", &self.codec, self.scale, self.rate));
        let mut bih = Vec::with_capacity(40);
        put_u32(&mut bih, 40);
        put_u32(&mut bih, self.width);
        put_u32(&mut bih, (-(self.height as i32)) as u32); // top-down
        put_u16(&mut bih, 1);
        put_u16(&mut bih, 24);
        bih.extend_from_slice(&self.codec);
        bih.extend_from_slice(&[0u8; 20]);
        chunk(&mut vstrl, b"strf", &bih);
        list(&mut hdrl, b"strl", &vstrl);

        if let Some((sample_rate, channels)) = self.audio {
            let block_align = channels * 2;
            let mut astrl = Vec::new();
            chunk(
                &mut astrl,
                b"strh",
                &self.strh(b"auds", &[0; 4], block_align as u32, sample_rate * block_align as u32),
            );
            let mut wfx = Vec::with_capacity(18);
            put_u16(&mut wfx, 1); // PCM
            put_u16(&mut wfx, channels);
            put_u32(&mut wfx, sample_rate);
            put_u32(&mut wfx, sample_rate * block_align as u32);
            put_u16(&mut wfx, block_align);
            put_u16(&mut wfx, 16);
            put_u16(&mut wfx, 0);
            chunk(&mut astrl, b"strf", &wfx);
            chunk(&mut astrl, b"strn", b"audio\0");
            list(&mut hdrl, b"strl", &astrl);
        }

        let mut riff_body = Vec::new();
        riff_body.extend_from_slice(b"AVI ");
        list(&mut riff_body, b"hdrl", &hdrl);
        chunk(&mut riff_body, b"JUNK", &[0u8; 12]);

        if let Some(entries) = &self.movi {
            let mut movi = Vec::new();
            for entry in entries {
                match entry {
                    MoviEntry::Chunk(tag, data) => chunk(&mut movi, tag, data),
                    MoviEntry::Rec(chunks) => {
                        let mut rec = Vec::new();
                        for (tag, data) in chunks {
                            chunk(&mut rec, tag, data);
                        }
                        list(&mut movi, b"rec ", &rec);
                    }
                }
            }
            list(&mut riff_body, b"movi", &movi);
        }

        let mut out = Vec::with_capacity(riff_body.len() + 8);
        out.extend_from_slice(b"RIFF");
        put_u32(&mut out, riff_body.len() as u32);
        out.extend_from_slice(&riff_body);
        out
    }
}
