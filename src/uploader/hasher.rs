// 流式 MD5 累加器

/// 包装 md5::Context，用于分片 hash、分带 hash 以及文件 hash
pub struct HashingAccumulator {
    ctx: md5::Context,
}

impl HashingAccumulator {
    pub fn new() -> Self {
        Self {
            ctx: md5::Context::new(),
        }
    }

    /// 追加字节
    pub fn append(&mut self, data: &[u8]) {
        self.ctx.consume(data);
    }

    /// 追加字符串（用于折叠分带 hash 的十六进制文本）
    pub fn append_str(&mut self, text: &str) {
        self.ctx.consume(text.as_bytes());
    }

    /// 结束并返回小写十六进制摘要
    pub fn finish(self) -> String {
        format!("{:x}", self.ctx.compute())
    }

    /// 一次性计算摘要
    pub fn digest(data: &[u8]) -> String {
        format!("{:x}", md5::compute(data))
    }
}

impl Default for HashingAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HashingAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashingAccumulator").finish_non_exhaustive()
    }
}
