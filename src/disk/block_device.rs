use crate::fs::error::Result;

/// 块设备抽象：以块为单位的读写接口
///
/// 块大小在创建设备时固定，块号范围 [0, total_blocks)。
/// 越界块号返回 InvalidBlockId，设备已释放则返回 NotInitialized。
pub trait BlockDevice: Send + Sync {
    /// 每块大小（字节）
    fn block_size(&self) -> usize;

    /// 设备总块数
    fn total_blocks(&self) -> u64;

    /// 读取一个块，恰好填满 buf 的前 block_size 字节；
    /// 介质不足一块时用 0 补齐
    fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<()>;

    /// 写入一个块；输入不足 block_size 用 0 补齐，超出则截断
    fn write_block(&self, block_id: u64, buf: &[u8]) -> Result<()>;

    /// 将整个介质清零，总大小不变
    fn format(&self) -> Result<()>;

    /// 释放底层介质，之后所有读写都失败
    fn release(&self);
}
